// SPDX-License-Identifier: Apache-2.0

use crate::meta::{AttrDtype, AttrMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub dataframe: DataframeSchema,
    pub annotations: AnnotationsSchema,
    pub layout: LayoutSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataframeSchema {
    #[serde(rename = "nObs")]
    pub n_obs: usize,
    #[serde(rename = "nVar")]
    pub n_var: usize,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationsSchema {
    pub obs: AxisSchema,
    pub var: AxisSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSchema {
    pub columns: Vec<ColumnSchema>,
    pub index: String,
}

impl AxisSchema {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSchema {
    pub obs: Vec<EmbeddingSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub dims: Vec<String>,
}

impl EmbeddingSchema {
    #[must_use]
    pub fn two_dimensional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "float32".to_string(),
            dims: vec![format!("{name}_0"), format!("{name}_1")],
        }
    }
}

impl Schema {
    /// True when any obs column is user-writable, which makes obs annotation
    /// responses uncacheable.
    #[must_use]
    pub fn has_writable_obs(&self) -> bool {
        self.annotations.obs.columns.iter().any(|c| c.writable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Obs,
    Var,
}

impl Axis {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Obs => "obs",
            Self::Var => "var",
        }
    }
}

/// Schema entry for one attribute, or `None` if the attribute is hidden.
///
/// `categories` is the stored category table when the column is
/// dictionary-encoded. Tables longer than `max_categories` are presented as
/// plain strings.
#[must_use]
pub fn column_schema(
    axis: Axis,
    attr: &AttrMeta,
    categories: Option<&[String]>,
    max_categories: usize,
) -> Option<ColumnSchema> {
    let mut categories_out = None;
    let kind = match (&attr.dtype, axis) {
        (AttrDtype::Int64, Axis::Obs) => return None,
        (AttrDtype::Float32 | AttrDtype::Float64, _) => "float32",
        (AttrDtype::Int32 | AttrDtype::Int64 | AttrDtype::Uint32, _) => "int32",
        (AttrDtype::Bool, Axis::Obs) => {
            categories_out = Some(vec![Value::Bool(false), Value::Bool(true)]);
            "categorical"
        }
        (AttrDtype::Bool, Axis::Var) => "boolean",
        (AttrDtype::String, _) => "string",
        (AttrDtype::Categorical, _) => match categories {
            Some(cats) if cats.len() <= max_categories => {
                categories_out = Some(cats.iter().map(|c| Value::String(c.clone())).collect());
                "categorical"
            }
            _ => "string",
        },
    };
    let hint = attr.schema_hint.clone().unwrap_or_default();
    let kind = hint.kind.unwrap_or_else(|| kind.to_string());
    if kind != "categorical" {
        categories_out = None;
    }
    Some(ColumnSchema {
        name: attr.name.clone(),
        kind,
        writable: hint.writable,
        categories: categories_out,
    })
}

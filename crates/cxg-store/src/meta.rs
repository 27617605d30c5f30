// SPDX-License-Identifier: Apache-2.0

//! JSON sidecars that describe a store's layout.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const GROUP_METADATA: &str = "cxg_group_metadata.json";
pub const ARRAY_META: &str = "__array.json";
pub const DATAFRAME_META: &str = "__dataframe.json";
pub const GENESETS: &str = "genesets.json";
pub const CXG_VERSION: &str = "0.3.0";

/// Category label to color (hex string), per annotation column.
pub type CategoryColors = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CxgProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(
        rename = "X_approximate_distribution",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub x_approximate_distribution: Option<ApproxDistribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub cxg_version: String,
    #[serde(default)]
    pub cxg_properties: CxgProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpora: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cxg_category_colors: Option<CategoryColors>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApproxDistribution {
    #[default]
    Normal,
    Count,
}

impl ApproxDistribution {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Count => "count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayEncoding {
    /// Float32 values in `data.bin`, cut into column bands
    /// `tile_extent[1]` wide; each band is stored row-major.
    Dense,
    /// Compressed rows: `indptr.bin` has `shape[0] + 1` entries.
    Csr,
    /// Compressed columns: `indptr.bin` has `shape[1] + 1` entries.
    Csc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub shape: [usize; 2],
    pub tile_extent: [usize; 2],
    pub encoding: ArrayEncoding,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrDtype {
    Float32,
    Float64,
    Int32,
    Int64,
    Uint32,
    Bool,
    String,
    Categorical,
}

/// Overrides the type inferred from an attribute's dtype.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaHint {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrMeta {
    pub name: String,
    pub dtype: AttrDtype,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hint: Option<SchemaHint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrameMeta {
    pub index: String,
    pub nrows: usize,
    pub attributes: Vec<AttrMeta>,
}

impl DataFrameMeta {
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttrMeta> {
        self.attributes.iter().find(|a| a.name == name)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneSetGene {
    pub gene_symbol: String,
    #[serde(default)]
    pub gene_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneSet {
    pub geneset_name: String,
    #[serde(default)]
    pub geneset_description: String,
    #[serde(default)]
    pub genes: Vec<GeneSetGene>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupIndex {
    pub members: Vec<String>,
}

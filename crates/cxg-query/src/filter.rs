// SPDX-License-Identifier: Apache-2.0

//! Two-axis filters: model, query-string parsing, and evaluation to masks.

use cxg_codec::Column;
use cxg_core::CxgError;
use cxg_store::{Axis, CxgAdaptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obs: Option<AxisFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var: Option<AxisFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<Vec<IndexClause>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_value: Option<Vec<Clause>>,
}

/// A single position or a half-open `[start, stop)` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexClause {
    Single(usize),
    Range([usize; 2]),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipClause {
    pub name: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeClause {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Clauses carry either a value list or bounds, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Clause {
    Membership(MembershipClause),
    Range(RangeClause),
}

impl Clause {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Membership(c) => &c.name,
            Self::Range(c) => &c.name,
        }
    }
}

impl Filter {
    #[must_use]
    pub fn axis(&self, axis: Axis) -> Option<&AxisFilter> {
        match axis {
            Axis::Obs => self.obs.as_ref(),
            Axis::Var => self.var.as_ref(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.obs.is_none() && self.var.is_none()
    }

    /// Parses a JSON filter document, mapping shape errors to filter errors.
    pub fn from_json(value: Value) -> Result<Self, CxgError> {
        serde_json::from_value(value).map_err(|e| CxgError::filter(format!("malformed filter: {e}")))
    }
}

fn axis_from_str(raw: &str) -> Option<Axis> {
    match raw {
        "obs" => Some(Axis::Obs),
        "var" => Some(Axis::Var),
        _ => None,
    }
}

fn parse_bound(raw: &str) -> Result<Option<f64>, ()> {
    let raw = raw.trim();
    if raw == "*" {
        return Ok(None);
    }
    raw.parse::<f64>().map(Some).map_err(|_| ())
}

fn parse_index(raw: &str) -> Result<IndexClause, CxgError> {
    let bad = || CxgError::filter(format!("malformed index clause {raw}"));
    match raw.split_once('-') {
        Some((a, b)) => Ok(IndexClause::Range([
            a.parse().map_err(|_| bad())?,
            b.parse().map_err(|_| bad())?,
        ])),
        None => Ok(IndexClause::Single(raw.parse().map_err(|_| bad())?)),
    }
}

/// Builds a filter from `<axis>:<column>=<value>` query parameters.
///
/// `min,max` values (either side may be `*`) are range clauses, and
/// `<axis>:index=<i>` or `<axis>:index=<start>-<stop>` select positions.
/// Repeated keys for one column collapse into a single membership clause.
/// Parameters without an axis prefix are ignored.
pub fn filter_from_query<K, V>(pairs: &[(K, V)]) -> Result<Filter, CxgError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut filter = Filter::default();
    for (key, value) in pairs {
        let (key, value) = (key.as_ref(), value.as_ref());
        let Some((axis_raw, column)) = key.split_once(':') else {
            continue;
        };
        let axis = axis_from_str(axis_raw)
            .ok_or_else(|| CxgError::filter(format!("unknown filter axis {axis_raw}")))?;
        if column.is_empty() {
            return Err(CxgError::filter(format!("filter key {key} names no column")));
        }
        let slot = match axis {
            Axis::Obs => &mut filter.obs,
            Axis::Var => &mut filter.var,
        };
        let axis_filter = slot.get_or_insert_with(AxisFilter::default);
        if column == "index" {
            axis_filter
                .index
                .get_or_insert_with(Vec::new)
                .push(parse_index(value)?);
            continue;
        }
        let clauses = axis_filter.annotation_value.get_or_insert_with(Vec::new);
        if let Some((lo, hi)) = value.split_once(',') {
            if let (Ok(min), Ok(max)) = (parse_bound(lo), parse_bound(hi)) {
                clauses.push(Clause::Range(RangeClause {
                    name: column.to_string(),
                    min,
                    max,
                }));
                continue;
            }
        }
        let existing = clauses.iter_mut().find_map(|c| match c {
            Clause::Membership(m) if m.name == column => Some(m),
            _ => None,
        });
        match existing {
            Some(m) => m.values.push(Value::String(value.to_string())),
            None => clauses.push(Clause::Membership(MembershipClause {
                name: column.to_string(),
                values: vec![Value::String(value.to_string())],
            })),
        }
    }
    Ok(filter)
}

/// Checks clause names, index bounds, and clause shapes against the dataset
/// without reading any column.
pub fn validate_axis(adaptor: &CxgAdaptor, axis: Axis, filter: &AxisFilter) -> Result<(), CxgError> {
    let len = axis_len(adaptor, axis);
    for clause in filter.index.iter().flatten() {
        let ok = match clause {
            IndexClause::Single(i) => *i < len,
            IndexClause::Range([a, b]) => a <= b && *b <= len,
        };
        if !ok {
            return Err(CxgError::filter(format!(
                "{} index clause {clause:?} out of range for {len}",
                axis.as_str()
            )));
        }
    }
    for clause in filter.annotation_value.iter().flatten() {
        if !adaptor.has_column(axis, clause.name()) {
            return Err(CxgError::filter(format!(
                "unknown {} annotation {}",
                axis.as_str(),
                clause.name()
            )));
        }
        if let Clause::Range(r) = clause {
            if r.min.is_none() && r.max.is_none() {
                return Err(CxgError::filter(format!(
                    "range clause on {} has no bounds",
                    r.name
                )));
            }
        }
    }
    Ok(())
}

fn axis_len(adaptor: &CxgAdaptor, axis: Axis) -> usize {
    let (n_obs, n_var) = adaptor.shape();
    match axis {
        Axis::Obs => n_obs,
        Axis::Var => n_var,
    }
}

/// Row masks selected by a filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// `None` selects the whole axis.
    pub obs: Option<Vec<bool>>,
    pub var: Option<Vec<bool>>,
}

impl Selection {
    #[must_use]
    pub fn mask(&self, axis: Axis) -> Option<&[bool]> {
        match axis {
            Axis::Obs => self.obs.as_deref(),
            Axis::Var => self.var.as_deref(),
        }
    }
}

/// Validates and evaluates `filter`. Axes outside `allowed` are rejected.
pub fn resolve_filter(
    adaptor: &CxgAdaptor,
    filter: &Filter,
    allowed: &[Axis],
) -> Result<Selection, CxgError> {
    for axis in [Axis::Obs, Axis::Var] {
        if let Some(f) = filter.axis(axis) {
            if !allowed.contains(&axis) {
                return Err(CxgError::filter(format!(
                    "{} filter is not supported here",
                    axis.as_str()
                )));
            }
            validate_axis(adaptor, axis, f)?;
        }
    }
    Ok(Selection {
        obs: filter
            .obs
            .as_ref()
            .map(|f| axis_mask(adaptor, Axis::Obs, f))
            .transpose()?,
        var: filter
            .var
            .as_ref()
            .map(|f| axis_mask(adaptor, Axis::Var, f))
            .transpose()?,
    })
}

/// Index clauses are unioned, annotation clauses intersected, and the two
/// groups intersected with each other.
fn axis_mask(adaptor: &CxgAdaptor, axis: Axis, filter: &AxisFilter) -> Result<Vec<bool>, CxgError> {
    let len = axis_len(adaptor, axis);
    let mut mask = match &filter.index {
        Some(clauses) => {
            let mut m = vec![false; len];
            for clause in clauses {
                match clause {
                    IndexClause::Single(i) => m[*i] = true,
                    IndexClause::Range([a, b]) => m[*a..*b].iter_mut().for_each(|x| *x = true),
                }
            }
            m
        }
        None => vec![true; len],
    };
    for clause in filter.annotation_value.iter().flatten() {
        let column = adaptor.query(axis, clause.name())?;
        let hits = clause_mask(clause, &column)?;
        for (m, h) in mask.iter_mut().zip(hits) {
            *m &= h;
        }
    }
    Ok(mask)
}

fn value_label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_values(column: &Column) -> Option<Vec<f64>> {
    match column {
        Column::Json(values) => values.iter().map(value_number).collect(),
        Column::Categorical { .. } | Column::Strings(_) | Column::Bool(_) => None,
        other => other
            .to_f32_dense()
            .map(|v| v.into_iter().map(f64::from).collect()),
    }
}

/// Evaluates one annotation clause over a column.
pub fn clause_mask(clause: &Clause, column: &Column) -> Result<Vec<bool>, CxgError> {
    match clause {
        Clause::Range(r) => {
            let values = numeric_values(column).ok_or_else(|| {
                CxgError::filter(format!("range filter on non-numeric column {}", r.name))
            })?;
            Ok(values
                .iter()
                .map(|v| {
                    !v.is_nan()
                        && r.min.map_or(true, |lo| *v >= lo)
                        && r.max.map_or(true, |hi| *v <= hi)
                })
                .collect())
        }
        Clause::Membership(m) => {
            let labels: Vec<String> = m.values.iter().map(value_label).collect();
            match column {
                Column::Categorical { codes, categories } => {
                    let wanted: Vec<bool> =
                        categories.iter().map(|c| labels.contains(c)).collect();
                    // codes past the category list match nothing
                    Ok(codes
                        .iter()
                        .map(|c| wanted.get(*c as usize).copied().unwrap_or(false))
                        .collect())
                }
                Column::Strings(values) => Ok(values.iter().map(|v| labels.contains(v)).collect()),
                Column::Bool(values) => Ok(values
                    .iter()
                    .map(|b| labels.iter().any(|l| l == if *b { "true" } else { "false" }))
                    .collect()),
                Column::Float32(values) => {
                    let targets = number_targets(m)?;
                    Ok(values
                        .iter()
                        .map(|v| targets.iter().any(|t| *v == *t as f32))
                        .collect())
                }
                other => {
                    let targets = number_targets(m)?;
                    let values = numeric_values(other).ok_or_else(|| {
                        CxgError::filter(format!("cannot filter column {}", m.name))
                    })?;
                    Ok(values.iter().map(|v| targets.contains(v)).collect())
                }
            }
        }
    }
}

fn number_targets(m: &MembershipClause) -> Result<Vec<f64>, CxgError> {
    m.values
        .iter()
        .map(|v| {
            value_number(v).ok_or_else(|| {
                CxgError::filter(format!("value {v} is not a number for column {}", m.name))
            })
        })
        .collect()
}

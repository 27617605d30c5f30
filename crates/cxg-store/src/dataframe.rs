// SPDX-License-Identifier: Apache-2.0

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreErrorCode};
use crate::meta::{AttrDtype, AttrMeta, DataFrameMeta, DATAFRAME_META};
use cxg_codec::{decode_matrix, Column};
use serde_json::Value;

pub const BOOL_CATEGORIES: [&str; 2] = ["false", "true"];

pub fn read_dataframe_meta(
    backend: &dyn StorageBackend,
    prefix: &str,
) -> Result<DataFrameMeta, StoreError> {
    let meta: DataFrameMeta =
        serde_json::from_slice(&backend.read(&format!("{prefix}/{DATAFRAME_META}"))?)?;
    if meta.attribute(&meta.index).is_none() {
        return Err(StoreError::validation(format!(
            "{prefix}: index column {} is not an attribute",
            meta.index
        )));
    }
    Ok(meta)
}

/// Reads one attribute and coerces the wire column to the declared dtype.
pub fn read_attribute(
    backend: &dyn StorageBackend,
    prefix: &str,
    meta: &DataFrameMeta,
    attr: &AttrMeta,
) -> Result<Column, StoreError> {
    let bytes = backend.read(&format!("{prefix}/{}", attr.file))?;
    let mut matrix = decode_matrix(&bytes)?;
    if matrix.n_cols() != 1 || matrix.n_rows != meta.nrows {
        return Err(StoreError::validation(format!(
            "{prefix}/{}: expected one column of {} rows",
            attr.file, meta.nrows
        )));
    }
    let column = matrix.columns.remove(0);
    coerce(&attr.dtype, column).ok_or_else(|| {
        StoreError::validation(format!(
            "{prefix}/{}: stored column does not match dtype {:?}",
            attr.file, attr.dtype
        ))
    })
}

fn coerce(dtype: &AttrDtype, column: Column) -> Option<Column> {
    match (dtype, column) {
        (AttrDtype::Float32 | AttrDtype::Float64, c @ Column::Float32(_)) => Some(c),
        (AttrDtype::Int32 | AttrDtype::Int64, c @ (Column::Int32(_) | Column::Json(_))) => Some(c),
        (AttrDtype::Uint32, c @ Column::UInt32(_)) => Some(c),
        (AttrDtype::Bool, Column::UInt32(v)) => Some(Column::Bool(v.iter().map(|x| *x != 0).collect())),
        (AttrDtype::Categorical, c @ Column::Categorical { .. }) => Some(c),
        (AttrDtype::String, Column::Json(values)) => values
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Column::Strings),
        _ => None,
    }
}

/// Boolean obs columns are served as two-category categoricals.
#[must_use]
pub fn bool_as_categorical(column: Column) -> Column {
    match column {
        Column::Bool(v) => Column::Categorical {
            codes: v.iter().map(|b| u32::from(*b)).collect(),
            categories: BOOL_CATEGORIES.iter().map(ToString::to_string).collect(),
        },
        other => other,
    }
}

pub(crate) fn unknown_name(axis: &str, name: &str) -> StoreError {
    StoreError::new(
        StoreErrorCode::UnknownName,
        format!("unknown {axis} annotation {name}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_dtype_is_read_from_uint_codes() {
        let col = coerce(&AttrDtype::Bool, Column::UInt32(vec![0, 1, 1])).expect("bool");
        assert_eq!(col, Column::Bool(vec![false, true, true]));
        assert_eq!(
            bool_as_categorical(col).category_labels().expect("labels"),
            vec!["false", "true", "true"]
        );
    }

    #[test]
    fn string_dtype_rejects_non_string_json() {
        assert!(coerce(&AttrDtype::String, Column::Json(vec![Value::from(1)])).is_none());
        assert!(coerce(&AttrDtype::Float32, Column::Int32(vec![1])).is_none());
    }
}

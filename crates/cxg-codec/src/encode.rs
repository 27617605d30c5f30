// SPDX-License-Identifier: Apache-2.0

use crate::column::{Column, Matrix};
use crate::error::CodecError;
use crate::wire::{len_u32, TypeCode, Writer, FLAG_COL_INDEX, MAGIC, VERSION};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncodeOptions {
    /// Dense float columns whose fraction of non-zeros is below this value are
    /// written with the sparse coder.
    pub sparse_threshold: Option<f64>,
}

pub fn encode_matrix(matrix: &Matrix) -> Result<Vec<u8>, CodecError> {
    encode_matrix_with(matrix, EncodeOptions::default())
}

pub fn encode_matrix_with(matrix: &Matrix, opts: EncodeOptions) -> Result<Vec<u8>, CodecError> {
    for (i, col) in matrix.columns.iter().enumerate() {
        if col.len() != matrix.n_rows {
            return Err(CodecError::ColumnLength {
                column: i,
                expected: matrix.n_rows,
                actual: col.len(),
            });
        }
    }
    if let Some(idx) = &matrix.col_index {
        if idx.len() != matrix.columns.len() {
            return Err(CodecError::ColIndexLength {
                expected: matrix.columns.len(),
                actual: idx.len(),
            });
        }
    }

    let mut w = Writer::with_capacity(16 + matrix.n_rows * matrix.columns.len() * 4);
    w.bytes(MAGIC);
    w.u8(VERSION);
    w.u32(len_u32(matrix.n_rows)?);
    w.u32(len_u32(matrix.columns.len())?);
    w.u8(if matrix.col_index.is_some() {
        FLAG_COL_INDEX
    } else {
        0
    });
    if let Some(idx) = &matrix.col_index {
        encode_column(&mut w, idx, EncodeOptions::default())?;
    }
    for col in &matrix.columns {
        encode_column(&mut w, col, opts)?;
    }
    Ok(w.buf)
}

fn encode_column(w: &mut Writer, col: &Column, opts: EncodeOptions) -> Result<(), CodecError> {
    match col {
        Column::Float32(v) => encode_f32(w, v, opts),
        Column::Float64(v) => {
            let narrowed: Vec<f32> = v.iter().map(|x| *x as f32).collect();
            encode_f32(w, &narrowed, opts)
        }
        Column::Int32(v) => {
            w.u8(TypeCode::DenseInt32 as u8);
            w.u32(len_u32(v.len())?);
            w.i32_slice(v);
            Ok(())
        }
        Column::Int64(v) => encode_i64(w, v),
        Column::UInt32(v) => {
            w.u8(TypeCode::DenseUInt32 as u8);
            w.u32(len_u32(v.len())?);
            w.u32_slice(v);
            Ok(())
        }
        Column::UInt64(v) => {
            if v.iter().all(|x| u32::try_from(*x).is_ok()) {
                let narrowed: Vec<u32> = v.iter().map(|x| *x as u32).collect();
                w.u8(TypeCode::DenseUInt32 as u8);
                w.u32(len_u32(narrowed.len())?);
                w.u32_slice(&narrowed);
                Ok(())
            } else {
                encode_json(w, &v.iter().map(|x| Value::from(*x)).collect::<Vec<_>>())
            }
        }
        Column::Bool(v) => {
            let codes: Vec<u32> = v.iter().map(|x| u32::from(*x)).collect();
            w.u8(TypeCode::DenseUInt32 as u8);
            w.u32(len_u32(codes.len())?);
            w.u32_slice(&codes);
            Ok(())
        }
        Column::SparseFloat32 {
            len,
            indices,
            values,
        } => encode_sparse_f32(w, *len, indices, values),
        Column::SparseFloat64 {
            len,
            indices,
            values,
        } => {
            let narrowed: Vec<f32> = values.iter().map(|x| *x as f32).collect();
            encode_sparse_f32(w, *len, indices, &narrowed)
        }
        Column::SparseInt { .. } => {
            // integer sparse data is densified
            let dense = densify_int(col)?;
            encode_i64(w, &dense)
        }
        Column::Categorical { codes, categories } => encode_categorical(w, codes, categories),
        Column::Strings(v) => {
            let values: Vec<Value> = v.iter().map(|s| Value::String(s.clone())).collect();
            encode_json(w, &values)
        }
        Column::Json(v) => encode_json(w, v),
    }
}

fn encode_f32(w: &mut Writer, v: &[f32], opts: EncodeOptions) -> Result<(), CodecError> {
    if let Some(threshold) = opts.sparse_threshold {
        if !v.is_empty() {
            let nnz = v.iter().filter(|x| **x != 0.0).count();
            if (nnz as f64) / (v.len() as f64) < threshold {
                if let Column::SparseFloat32 {
                    len,
                    indices,
                    values,
                } = Column::sparse_from_dense(v)
                {
                    return encode_sparse_f32(w, len, &indices, &values);
                }
            }
        }
    }
    w.u8(TypeCode::DenseFloat32 as u8);
    w.u32(len_u32(v.len())?);
    w.f32_slice(v);
    Ok(())
}

fn encode_i64(w: &mut Writer, v: &[i64]) -> Result<(), CodecError> {
    if v.iter().all(|x| i32::try_from(*x).is_ok()) {
        let narrowed: Vec<i32> = v.iter().map(|x| *x as i32).collect();
        w.u8(TypeCode::DenseInt32 as u8);
        w.u32(len_u32(narrowed.len())?);
        w.i32_slice(&narrowed);
        Ok(())
    } else {
        // out of int32 range: fall back to the polymorphic coder
        encode_json(w, &v.iter().map(|x| Value::from(*x)).collect::<Vec<_>>())
    }
}

fn densify_int(col: &Column) -> Result<Vec<i64>, CodecError> {
    let Column::SparseInt {
        len,
        indices,
        values,
    } = col
    else {
        return Ok(Vec::new());
    };
    let mut out = vec![0_i64; *len];
    for (i, v) in indices.iter().zip(values) {
        let slot = out.get_mut(*i as usize).ok_or(CodecError::SparseIndex {
            index: *i,
            size: *len,
        })?;
        *slot = *v;
    }
    Ok(out)
}

fn encode_sparse_f32(
    w: &mut Writer,
    len: usize,
    indices: &[u32],
    values: &[f32],
) -> Result<(), CodecError> {
    if indices.len() != values.len() {
        return Err(CodecError::ColumnLength {
            column: 0,
            expected: indices.len(),
            actual: values.len(),
        });
    }
    if let Some(bad) = indices.iter().find(|i| **i as usize >= len) {
        return Err(CodecError::SparseIndex {
            index: *bad,
            size: len,
        });
    }
    w.u8(TypeCode::SparseFloat32 as u8);
    w.u32(len_u32(len)?);
    w.u32(len_u32(indices.len())?);
    w.u32_slice(indices);
    w.f32_slice(values);
    Ok(())
}

fn encode_categorical(
    w: &mut Writer,
    codes: &[u32],
    categories: &[String],
) -> Result<(), CodecError> {
    if let Some(bad) = codes.iter().find(|c| **c as usize >= categories.len()) {
        return Err(CodecError::InvalidCategoryCode {
            code: *bad,
            categories: categories.len(),
        });
    }
    let code = TypeCode::categorical_for(categories.len());
    w.u8(code as u8);
    w.u32(len_u32(codes.len())?);
    match code {
        TypeCode::CategoricalU8 => {
            for c in codes {
                w.u8(*c as u8);
            }
        }
        TypeCode::CategoricalU16 => {
            for c in codes {
                w.bytes(&(*c as u16).to_le_bytes());
            }
        }
        _ => w.u32_slice(codes),
    }
    let table = serde_json::to_vec(categories).map_err(|e| CodecError::Json(e.to_string()))?;
    w.u32(len_u32(table.len())?);
    w.bytes(&table);
    Ok(())
}

fn encode_json(w: &mut Writer, values: &[Value]) -> Result<(), CodecError> {
    let bytes = serde_json::to_vec(values).map_err(|e| CodecError::Json(e.to_string()))?;
    w.u8(TypeCode::Json as u8);
    w.u32(len_u32(bytes.len())?);
    w.bytes(&bytes);
    Ok(())
}

/// Converts floats into JSON numbers, failing on NaN or infinity.
pub fn finite_json_values(values: &[f64], context: &str) -> Result<Vec<Value>, CodecError> {
    values
        .iter()
        .map(|v| {
            serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .ok_or_else(|| CodecError::NonFinite(format!("{context}: {v}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_column_length_disagreeing_with_header() {
        let m = Matrix::new(3, vec![Column::Float32(vec![1.0, 2.0])]);
        assert!(matches!(
            encode_matrix(&m),
            Err(CodecError::ColumnLength {
                column: 0,
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn rejects_col_index_length_mismatch() {
        let m = Matrix::new(1, vec![Column::Int32(vec![1])])
            .with_col_index(Column::Strings(vec!["a".into(), "b".into()]));
        assert!(matches!(
            encode_matrix(&m),
            Err(CodecError::ColIndexLength { .. })
        ));
    }

    #[test]
    fn nan_cannot_become_json() {
        assert!(matches!(
            finite_json_values(&[1.0, f64::NAN], "lfc"),
            Err(CodecError::NonFinite(_))
        ));
        assert!(finite_json_values(&[f64::INFINITY], "lfc").is_err());
        assert_eq!(finite_json_values(&[0.5], "lfc").expect("finite").len(), 1);
    }

    #[test]
    fn invalid_category_code_is_rejected() {
        let m = Matrix::new(
            1,
            vec![Column::Categorical {
                codes: vec![2],
                categories: vec!["a".into(), "b".into()],
            }],
        );
        assert!(matches!(
            encode_matrix(&m),
            Err(CodecError::InvalidCategoryCode { code: 2, .. })
        ));
    }
}

// SPDX-License-Identifier: Apache-2.0

use crate::column::{Column, Matrix};
use crate::error::CodecError;
use crate::wire::{Reader, TypeCode, FLAG_COL_INDEX, MAGIC, VERSION};
use serde_json::Value;

pub fn decode_matrix(bytes: &[u8]) -> Result<Matrix, CodecError> {
    let mut r = Reader::new(bytes);
    if r.take(MAGIC.len())? != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let n_rows = r.u32()? as usize;
    let n_cols = r.u32()? as usize;
    let flags = r.u8()?;

    let col_index = if flags & FLAG_COL_INDEX != 0 {
        let idx = decode_column(&mut r)?;
        if idx.len() != n_cols {
            return Err(CodecError::ColIndexLength {
                expected: n_cols,
                actual: idx.len(),
            });
        }
        Some(idx)
    } else {
        None
    };

    let mut columns = Vec::with_capacity(n_cols.min(4096));
    for i in 0..n_cols {
        if r.remaining() == 0 {
            return Err(CodecError::ColumnCount {
                expected: n_cols,
                actual: i,
            });
        }
        let col = decode_column(&mut r)?;
        if col.len() != n_rows {
            return Err(CodecError::ColumnLength {
                column: i,
                expected: n_rows,
                actual: col.len(),
            });
        }
        columns.push(col);
    }
    if r.remaining() != 0 {
        return Err(CodecError::TrailingBytes(r.remaining()));
    }
    Ok(Matrix {
        n_rows,
        col_index,
        columns,
    })
}

fn decode_column(r: &mut Reader<'_>) -> Result<Column, CodecError> {
    let code = TypeCode::from_u8(r.u8()?)?;
    match code {
        TypeCode::DenseUInt32 => {
            let n = r.u32()? as usize;
            Ok(Column::UInt32(r.u32_vec(n)?))
        }
        TypeCode::DenseInt32 => {
            let n = r.u32()? as usize;
            Ok(Column::Int32(r.i32_vec(n)?))
        }
        TypeCode::DenseFloat32 => {
            let n = r.u32()? as usize;
            Ok(Column::Float32(r.f32_vec(n)?))
        }
        TypeCode::SparseFloat32 => {
            let len = r.u32()? as usize;
            let nnz = r.u32()? as usize;
            let indices = sparse_indices(r, nnz, len)?;
            let values = r.f32_vec(nnz)?;
            Ok(Column::SparseFloat32 {
                len,
                indices,
                values,
            })
        }
        TypeCode::SparseFloat64 => {
            let len = r.u32()? as usize;
            let nnz = r.u32()? as usize;
            let indices = sparse_indices(r, nnz, len)?;
            let values = r.f64_vec(nnz)?;
            Ok(Column::SparseFloat64 {
                len,
                indices,
                values,
            })
        }
        TypeCode::CategoricalU8 | TypeCode::CategoricalU16 | TypeCode::CategoricalU32 => {
            let n = r.u32()? as usize;
            let codes = match code {
                TypeCode::CategoricalU8 => r.u8_vec(n)?,
                TypeCode::CategoricalU16 => r.u16_vec(n)?,
                _ => r.u32_vec(n)?,
            };
            let table_len = r.u32()? as usize;
            let categories: Vec<String> = serde_json::from_slice(r.take(table_len)?)
                .map_err(|e| CodecError::Json(e.to_string()))?;
            if let Some(bad) = codes.iter().find(|c| **c as usize >= categories.len()) {
                return Err(CodecError::InvalidCategoryCode {
                    code: *bad,
                    categories: categories.len(),
                });
            }
            Ok(Column::Categorical { codes, categories })
        }
        TypeCode::Json => {
            let n = r.u32()? as usize;
            let values: Vec<Value> = serde_json::from_slice(r.take(n)?)
                .map_err(|e| CodecError::Json(e.to_string()))?;
            Ok(Column::Json(values))
        }
    }
}

fn sparse_indices(r: &mut Reader<'_>, nnz: usize, len: usize) -> Result<Vec<u32>, CodecError> {
    let indices = r.u32_vec(nnz)?;
    if let Some(bad) = indices.iter().find(|i| **i as usize >= len) {
        return Err(CodecError::SparseIndex {
            index: *bad,
            size: len,
        });
    }
    Ok(indices)
}

// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

/// One column of a heterogeneous table.
///
/// The encoder accepts every variant; the decoder only ever yields the wire
/// variants (`Float32`, `Int32`, `UInt32`, `SparseFloat32`, `SparseFloat64`,
/// `Categorical`, `Json`).
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Bool(Vec<bool>),
    SparseFloat32 {
        len: usize,
        indices: Vec<u32>,
        values: Vec<f32>,
    },
    SparseFloat64 {
        len: usize,
        indices: Vec<u32>,
        values: Vec<f64>,
    },
    SparseInt {
        len: usize,
        indices: Vec<u32>,
        values: Vec<i64>,
    },
    Categorical {
        codes: Vec<u32>,
        categories: Vec<String>,
    },
    Strings(Vec<String>),
    Json(Vec<Value>),
}

impl Column {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::UInt32(v) => v.len(),
            Self::UInt64(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::SparseFloat32 { len, .. }
            | Self::SparseFloat64 { len, .. }
            | Self::SparseInt { len, .. } => *len,
            Self::Categorical { codes, .. } => codes.len(),
            Self::Strings(v) => v.len(),
            Self::Json(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds a sparse float32 column from a dense slice, keeping non-zeros.
    #[must_use]
    pub fn sparse_from_dense(values: &[f32]) -> Self {
        let mut indices = Vec::new();
        let mut nz = Vec::new();
        for (i, v) in values.iter().enumerate() {
            if *v != 0.0 {
                indices.push(i as u32);
                nz.push(*v);
            }
        }
        Self::SparseFloat32 {
            len: values.len(),
            indices,
            values: nz,
        }
    }

    /// Dense float view of numeric columns; sparse columns are zero-filled.
    #[must_use]
    pub fn to_f32_dense(&self) -> Option<Vec<f32>> {
        match self {
            Self::Float32(v) => Some(v.clone()),
            Self::Float64(v) => Some(v.iter().map(|x| *x as f32).collect()),
            Self::Int32(v) => Some(v.iter().map(|x| *x as f32).collect()),
            Self::Int64(v) => Some(v.iter().map(|x| *x as f32).collect()),
            Self::UInt32(v) => Some(v.iter().map(|x| *x as f32).collect()),
            Self::UInt64(v) => Some(v.iter().map(|x| *x as f32).collect()),
            Self::Bool(v) => Some(v.iter().map(|x| f32::from(u8::from(*x))).collect()),
            Self::SparseFloat32 {
                len,
                indices,
                values,
            } => {
                let mut out = vec![0.0_f32; *len];
                for (i, v) in indices.iter().zip(values) {
                    out[*i as usize] = *v;
                }
                Some(out)
            }
            Self::SparseFloat64 {
                len,
                indices,
                values,
            } => {
                let mut out = vec![0.0_f32; *len];
                for (i, v) in indices.iter().zip(values) {
                    out[*i as usize] = *v as f32;
                }
                Some(out)
            }
            Self::SparseInt {
                len,
                indices,
                values,
            } => {
                let mut out = vec![0.0_f32; *len];
                for (i, v) in indices.iter().zip(values) {
                    out[*i as usize] = *v as f32;
                }
                Some(out)
            }
            Self::Categorical { .. } | Self::Strings(_) | Self::Json(_) => None,
        }
    }

    /// Category label for each row of a categorical column.
    #[must_use]
    pub fn category_labels(&self) -> Option<Vec<&str>> {
        match self {
            Self::Categorical { codes, categories } => codes
                .iter()
                .map(|c| categories.get(*c as usize).map(String::as_str))
                .collect(),
            _ => None,
        }
    }
}

/// A table ready for encoding, or the result of decoding one.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub n_rows: usize,
    pub col_index: Option<Column>,
    pub columns: Vec<Column>,
}

impl Matrix {
    #[must_use]
    pub fn new(n_rows: usize, columns: Vec<Column>) -> Self {
        Self {
            n_rows,
            col_index: None,
            columns,
        }
    }

    #[must_use]
    pub fn with_col_index(mut self, col_index: Column) -> Self {
        self.col_index = Some(col_index);
        self
    }

    /// String labels of the column index, when it is a name list.
    #[must_use]
    pub fn col_names(&self) -> Option<Vec<String>> {
        match self.col_index.as_ref()? {
            Column::Strings(v) => Some(v.clone()),
            Column::Json(v) => v
                .iter()
                .map(|x| x.as_str().map(ToString::to_string))
                .collect(),
            _ => None,
        }
    }

    #[must_use]
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }
}

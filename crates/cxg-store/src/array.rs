// SPDX-License-Identifier: Apache-2.0

use crate::backend::StorageBackend;
use crate::error::StoreError;
use crate::meta::{ArrayEncoding, ArrayMeta, ARRAY_META};
use std::ops::Range;

const F32: u64 = 4;

/// Compressed sparse lanes. A lane is a row for CSR and a column for CSC.
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub indptr: Vec<u64>,
    pub indices: Vec<u32>,
    pub data: Vec<f32>,
}

impl Compressed {
    #[must_use]
    pub fn lanes(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    /// Minor indices and values stored in lane `i`.
    #[must_use]
    pub fn lane(&self, i: usize) -> (&[u32], &[f32]) {
        let start = self.indptr[i] as usize;
        let end = self.indptr[i + 1] as usize;
        (&self.indices[start..end], &self.data[start..end])
    }

    fn validate(&self, lanes: usize, minor: usize, what: &str) -> Result<(), StoreError> {
        if self.indptr.len() != lanes + 1 {
            return Err(StoreError::validation(format!(
                "{what}: indptr has {} entries, expected {}",
                self.indptr.len(),
                lanes + 1
            )));
        }
        if self.indices.len() != self.data.len() {
            return Err(StoreError::validation(format!(
                "{what}: {} indices but {} values",
                self.indices.len(),
                self.data.len()
            )));
        }
        if self.indptr.first() != Some(&0)
            || self.indptr.windows(2).any(|w| w[0] > w[1])
            || self.indptr.last().copied() != Some(self.data.len() as u64)
        {
            return Err(StoreError::validation(format!("{what}: malformed indptr")));
        }
        if self.indices.iter().any(|i| *i as usize >= minor) {
            return Err(StoreError::validation(format!(
                "{what}: index out of range {minor}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XLayout {
    /// Row-major values, `n_obs * n_var` long.
    Dense(Vec<f32>),
    Sparse {
        rows: Compressed,
        /// Column-oriented mirror, used for var-major access when present.
        cols: Option<Compressed>,
    },
}

/// The expression matrix, cells by genes.
#[derive(Debug, Clone, PartialEq)]
pub struct XArray {
    pub n_obs: usize,
    pub n_var: usize,
    pub tile_extent: [usize; 2],
    pub layout: XLayout,
}

/// Dense row-major block produced by slicing.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseBlock {
    pub n_rows: usize,
    pub n_cols: usize,
    pub data: Vec<f32>,
}

impl DenseBlock {
    #[must_use]
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            data: vec![0.0; n_rows * n_cols],
        }
    }

    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.n_cols + col]
    }

    #[must_use]
    pub fn column(&self, col: usize) -> Vec<f32> {
        (0..self.n_rows).map(|r| self.get(r, col)).collect()
    }
}

impl XArray {
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        matches!(self.layout, XLayout::Sparse { .. })
    }

    /// Dense sub-matrix for the given row and column positions, in the order
    /// given. Positions must be in range.
    #[must_use]
    pub fn slice(&self, rows: &[usize], cols: &[usize]) -> DenseBlock {
        let mut out = DenseBlock::zeros(rows.len(), cols.len());
        if rows.is_empty() || cols.is_empty() {
            return out;
        }
        match &self.layout {
            XLayout::Dense(data) => {
                for (p, r) in rows.iter().enumerate() {
                    let row = &data[r * self.n_var..(r + 1) * self.n_var];
                    for (q, c) in cols.iter().enumerate() {
                        out.data[p * out.n_cols + q] = row[*c];
                    }
                }
            }
            XLayout::Sparse {
                cols: Some(csc), ..
            } if cols.len() < rows.len() => {
                let row_pos = positions(rows, self.n_obs);
                for (q, c) in cols.iter().enumerate() {
                    let (idx, vals) = csc.lane(*c);
                    for (r, v) in idx.iter().zip(vals) {
                        if let Some(p) = row_pos[*r as usize] {
                            out.data[p * out.n_cols + q] = *v;
                        }
                    }
                }
            }
            XLayout::Sparse { rows: csr, .. } => {
                let col_pos = positions(cols, self.n_var);
                for (p, r) in rows.iter().enumerate() {
                    let (idx, vals) = csr.lane(*r);
                    for (c, v) in idx.iter().zip(vals) {
                        if let Some(q) = col_pos[*c as usize] {
                            out.data[p * out.n_cols + q] = *v;
                        }
                    }
                }
            }
        }
        out
    }
}

/// Maps each selected index to its output position.
pub(crate) fn positions(selected: &[usize], len: usize) -> Vec<Option<usize>> {
    let mut pos = vec![None; len];
    for (i, s) in selected.iter().enumerate() {
        pos[*s] = Some(i);
    }
    pos
}

pub fn read_array_meta(
    backend: &dyn StorageBackend,
    prefix: &str,
) -> Result<ArrayMeta, StoreError> {
    let meta: ArrayMeta = serde_json::from_slice(&backend.read(&format!("{prefix}/{ARRAY_META}"))?)?;
    if meta.dtype != "float32" {
        return Err(StoreError::validation(format!(
            "{prefix}: unsupported dtype {}",
            meta.dtype
        )));
    }
    Ok(meta)
}

/// Columns held by band `band` of a dense array `n_cols` wide.
#[must_use]
pub fn band_columns(band: usize, band_width: usize, n_cols: usize) -> Range<usize> {
    let w = band_width.max(1);
    let start = (band * w).min(n_cols);
    start..(start + w).min(n_cols)
}

/// Reorders row-major values into the on-disk band order: the columns are
/// cut into bands `band_width` wide, and each band stores all of its rows
/// row-major, one band after another.
#[must_use]
pub fn to_banded(row_major: &[f32], n_rows: usize, n_cols: usize, band_width: usize) -> Vec<f32> {
    let w = band_width.max(1);
    let mut out = Vec::with_capacity(row_major.len());
    for band in 0..n_cols.div_ceil(w) {
        let cols = band_columns(band, w, n_cols);
        for r in 0..n_rows {
            out.extend_from_slice(&row_major[r * n_cols + cols.start..r * n_cols + cols.end]);
        }
    }
    out
}

fn from_banded(banded: &[f32], n_rows: usize, n_cols: usize, band_width: usize) -> Vec<f32> {
    let w = band_width.max(1);
    let mut out = vec![0.0; banded.len()];
    let mut at = 0;
    for band in 0..n_cols.div_ceil(w) {
        let cols = band_columns(band, w, n_cols);
        for r in 0..n_rows {
            out[r * n_cols + cols.start..r * n_cols + cols.end]
                .copy_from_slice(&banded[at..at + cols.len()]);
            at += cols.len();
        }
    }
    out
}

pub fn load_dense(backend: &dyn StorageBackend, prefix: &str) -> Result<DenseBlock, StoreError> {
    let meta = read_array_meta(backend, prefix)?;
    if meta.encoding != ArrayEncoding::Dense {
        return Err(StoreError::validation(format!("{prefix}: expected a dense array")));
    }
    let [n_rows, n_cols] = meta.shape;
    let banded = f32_values(&backend.read(&format!("{prefix}/data.bin"))?, prefix)?;
    if banded.len() != n_rows * n_cols {
        return Err(StoreError::validation(format!(
            "{prefix}: {} values for shape {n_rows}x{n_cols}",
            banded.len()
        )));
    }
    Ok(DenseBlock {
        n_rows,
        n_cols,
        data: from_banded(&banded, n_rows, n_cols, meta.tile_extent[1]),
    })
}

/// One band of a dense array, row-major over the band's columns. Only the
/// band's byte range is read.
pub fn read_dense_band(
    backend: &dyn StorageBackend,
    prefix: &str,
    meta: &ArrayMeta,
    band: usize,
) -> Result<Vec<f32>, StoreError> {
    let [n_rows, n_cols] = meta.shape;
    let cols = band_columns(band, meta.tile_extent[1], n_cols);
    let offset = (n_rows * cols.start) as u64 * F32;
    let len = (n_rows * cols.len()) as u64 * F32;
    let bytes = backend.read_range(&format!("{prefix}/data.bin"), offset, len)?;
    f32_values(&bytes, prefix)
}

/// Lane offsets of a compressed array, checked for shape and monotonicity.
pub fn read_indptr(
    backend: &dyn StorageBackend,
    prefix: &str,
    lanes: usize,
) -> Result<Vec<u64>, StoreError> {
    let indptr = u64_values(&backend.read(&format!("{prefix}/indptr.bin"))?, prefix)?;
    if indptr.len() != lanes + 1
        || indptr.first() != Some(&0)
        || indptr.windows(2).any(|w| w[0] > w[1])
    {
        return Err(StoreError::validation(format!("{prefix}: malformed indptr")));
    }
    Ok(indptr)
}

/// Minor indices and values of one lane, read by range.
pub fn read_lane(
    backend: &dyn StorageBackend,
    prefix: &str,
    indptr: &[u64],
    lane: usize,
    minor: usize,
) -> Result<(Vec<u32>, Vec<f32>), StoreError> {
    let (start, end) = match (indptr.get(lane), indptr.get(lane + 1)) {
        (Some(s), Some(e)) => (*s, *e),
        _ => return Err(StoreError::validation(format!("{prefix}: lane {lane} out of range"))),
    };
    let n = end - start;
    let indices = u32_values(
        &backend.read_range(&format!("{prefix}/indices.bin"), start * 4, n * 4)?,
        prefix,
    )?;
    let data = f32_values(
        &backend.read_range(&format!("{prefix}/data.bin"), start * F32, n * F32)?,
        prefix,
    )?;
    if let Some(bad) = indices.iter().find(|i| **i as usize >= minor) {
        return Err(StoreError::validation(format!(
            "{prefix}: lane {lane} holds index {bad} past {minor}"
        )));
    }
    Ok((indices, data))
}

fn load_compressed(
    backend: &dyn StorageBackend,
    prefix: &str,
) -> Result<Compressed, StoreError> {
    Ok(Compressed {
        indptr: u64_values(&backend.read(&format!("{prefix}/indptr.bin"))?, prefix)?,
        indices: u32_values(&backend.read(&format!("{prefix}/indices.bin"))?, prefix)?,
        data: f32_values(&backend.read(&format!("{prefix}/data.bin"))?, prefix)?,
    })
}

/// Loads `X` and, for sparse stores, its `Xc` column mirror when present.
pub fn load_x(backend: &dyn StorageBackend) -> Result<XArray, StoreError> {
    let meta = read_array_meta(backend, "X")?;
    let [n_obs, n_var] = meta.shape;
    let layout = match meta.encoding {
        ArrayEncoding::Dense => {
            let block = load_dense(backend, "X")?;
            XLayout::Dense(block.data)
        }
        ArrayEncoding::Csr => {
            let rows = load_compressed(backend, "X")?;
            rows.validate(n_obs, n_var, "X")?;
            let cols = if backend.exists(&format!("Xc/{ARRAY_META}"))? {
                let cmeta = read_array_meta(backend, "Xc")?;
                if cmeta.encoding != ArrayEncoding::Csc || cmeta.shape != meta.shape {
                    return Err(StoreError::validation("Xc does not mirror X"));
                }
                let cols = load_compressed(backend, "Xc")?;
                cols.validate(n_var, n_obs, "Xc")?;
                Some(cols)
            } else {
                None
            };
            XLayout::Sparse { rows, cols }
        }
        ArrayEncoding::Csc => {
            return Err(StoreError::validation("X must be dense or csr"));
        }
    };
    Ok(XArray {
        n_obs,
        n_var,
        tile_extent: [meta.tile_extent[0].max(1), meta.tile_extent[1].max(1)],
        layout,
    })
}

fn check_width(bytes: &[u8], width: usize, what: &str) -> Result<(), StoreError> {
    if bytes.len() % width != 0 {
        return Err(StoreError::validation(format!(
            "{what}: {} bytes is not a multiple of {width}",
            bytes.len()
        )));
    }
    Ok(())
}

fn f32_values(bytes: &[u8], what: &str) -> Result<Vec<f32>, StoreError> {
    check_width(bytes, 4, what)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn u32_values(bytes: &[u8], what: &str) -> Result<Vec<u32>, StoreError> {
    check_width(bytes, 4, what)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn u64_values(bytes: &[u8], what: &str) -> Result<Vec<u64>, StoreError> {
    check_width(bytes, 8, what)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

// SPDX-License-Identifier: Apache-2.0

use crate::column::Column;
use crate::error::CodecError;

/// Lossy quantization of float columns into `nbins` equal-width bins over the
/// column's own `[min, max]` range. Applied by the caller before encoding; the
/// wire format does not record the bin edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binning {
    pub nbins: u32,
}

impl Binning {
    pub fn new(nbins: u32) -> Result<Self, CodecError> {
        if nbins == 0 {
            return Err(CodecError::Binning("nbins must be > 0".to_string()));
        }
        Ok(Self { nbins })
    }

    pub fn bin(&self, values: &[f32]) -> Result<Vec<u32>, CodecError> {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for v in values {
            if !v.is_finite() {
                return Err(CodecError::Binning(format!(
                    "cannot bin non-finite value {v}"
                )));
            }
            lo = lo.min(*v);
            hi = hi.max(*v);
        }
        let span = f64::from(hi) - f64::from(lo);
        if values.is_empty() || span <= 0.0 {
            return Ok(vec![0; values.len()]);
        }
        let top = self.nbins - 1;
        Ok(values
            .iter()
            .map(|v| {
                let scaled = (f64::from(*v) - f64::from(lo)) / span * f64::from(self.nbins);
                (scaled.floor() as u32).min(top)
            })
            .collect())
    }

    /// Replaces a float column with its bin codes. Non-float columns are
    /// returned unchanged.
    pub fn apply(&self, column: Column) -> Result<Column, CodecError> {
        match column {
            Column::Float32(_)
            | Column::Float64(_)
            | Column::SparseFloat32 { .. }
            | Column::SparseFloat64 { .. } => {
                let dense = column.to_f32_dense().unwrap_or_default();
                Ok(Column::UInt32(self.bin(&dense)?))
            }
            other => Ok(other),
        }
    }
}

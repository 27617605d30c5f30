// SPDX-License-Identifier: Apache-2.0

use cxg_core::CxgError;
use cxg_store::{mask_indices, CxgAdaptor};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMethod {
    Mean,
}

impl SummaryMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
        }
    }
}

impl FromStr for SummaryMethod {
    type Err = CxgError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "mean" => Ok(Self::Mean),
            other => Err(CxgError::UnsupportedSummaryMethod(format!(
                "unknown gene set summary method: {other}"
            ))),
        }
    }
}

/// One value per cell, summarizing the variables selected by `var_mask`.
/// An empty selection summarizes to zeros.
pub fn summarize_var(
    adaptor: &CxgAdaptor,
    method: SummaryMethod,
    var_mask: Option<&[bool]>,
) -> Result<Vec<f32>, CxgError> {
    let (n_obs, n_var) = adaptor.shape();
    let cols = mask_indices(var_mask, n_var, "var")?;
    if cols.is_empty() {
        return Ok(vec![0.0; n_obs]);
    }
    let rows: Vec<usize> = (0..n_obs).collect();
    let block = adaptor.x_slice_indices(&rows, &cols)?;
    match method {
        SummaryMethod::Mean => {
            let width = block.n_cols as f64;
            Ok(block
                .data
                .chunks_exact(block.n_cols)
                .map(|row| (row.iter().map(|v| f64::from(*v)).sum::<f64>() / width) as f32)
                .collect())
        }
    }
}

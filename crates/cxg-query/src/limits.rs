// SPDX-License-Identifier: Apache-2.0

use cxg_core::CxgError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryLimits {
    /// Maximum number of annotation or gene columns per request.
    pub column_request_max: usize,
    /// Maximum `nA + nB` accepted by diffex. `None` is unbounded.
    pub diffexp_cellcount_max: Option<usize>,
    pub diffexp_lfc_cutoff: f64,
    pub diffexp_top_n: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            column_request_max: 32,
            diffexp_cellcount_max: None,
            diffexp_lfc_cutoff: 0.01,
            diffexp_top_n: 10,
        }
    }
}

impl QueryLimits {
    pub fn check_columns(&self, requested: usize) -> Result<(), CxgError> {
        if requested > self.column_request_max {
            return Err(CxgError::exceeds_limit(format!(
                "requested {requested} columns, limit is {}",
                self.column_request_max
            )));
        }
        Ok(())
    }

    pub fn check_cell_count(&self, n_a: usize, n_b: usize) -> Result<(), CxgError> {
        match self.diffexp_cellcount_max {
            Some(max) if n_a + n_b > max => Err(CxgError::exceeds_limit(format!(
                "diffexp over {} cells exceeds limit of {max}",
                n_a + n_b
            ))),
            _ => Ok(()),
        }
    }

    pub fn check_top_n(&self, top_n: usize) -> Result<(), CxgError> {
        if top_n == 0 {
            return Err(CxgError::filter("count must be a positive integer"));
        }
        Ok(())
    }
}

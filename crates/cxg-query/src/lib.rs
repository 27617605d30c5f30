// SPDX-License-Identifier: Apache-2.0

//! Read-side computations over an open dataset: filters, embedding
//! normalization, differential expression and per-cell summaries.

#![forbid(unsafe_code)]

mod diffexp;
mod filter;
mod limits;
mod normalize;
mod stats;
mod summarize;

pub use diffexp::{
    plan_bands, rank, DiffexConfig, DiffexEngine, DiffexRequest, DiffexResult, DiffexRow,
    GroupStats,
};
pub use filter::{
    clause_mask, filter_from_query, resolve_filter, validate_axis, AxisFilter, Clause, Filter, IndexClause, MembershipClause,
    RangeClause, Selection,
};
pub use limits::QueryLimits;
pub use normalize::normalize_embedding;
pub use stats::{student_t_sf, two_sided_p};
pub use summarize::{summarize_var, SummaryMethod};

pub const CRATE_NAME: &str = "cxg-query";

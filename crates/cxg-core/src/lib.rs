// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

pub mod canonical;
pub mod error;

pub use canonical::{
    canonical_query, query_fingerprint, sha1_hex, sha256_hex, stable_json_bytes,
};
pub use error::{AccessReason, CxgError, Result, Tombstone};

pub const CRATE_NAME: &str = "cxg-core";

/// Environment prefix shared by every runtime knob.
pub const ENV_PREFIX: &str = "CXG_";

// SPDX-License-Identifier: Apache-2.0

//! Compact columnar encoding for heterogeneous 2-D tables.
//!
//! Every bulk numeric response (annotations, layouts, expression slices,
//! summaries) is a [`Matrix`] encoded with [`encode_matrix`]. Each column picks
//! its coder from its array class and dtype: dense numbers, sparse floats,
//! dictionary-encoded categoricals, or a JSON list as the fallback.

#![forbid(unsafe_code)]

mod binning;
mod column;
mod decode;
mod encode;
mod error;
mod wire;

pub use binning::Binning;
pub use column::{Column, Matrix};
pub use decode::decode_matrix;
pub use encode::{encode_matrix, encode_matrix_with, finite_json_values, EncodeOptions};
pub use error::CodecError;
pub use wire::TypeCode;

pub const CRATE_NAME: &str = "cxg-codec";
pub const MEDIA_TYPE: &str = "application/octet-stream";

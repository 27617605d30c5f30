// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod adaptor;
mod array;
mod backend;
mod backend_http;
mod context;
mod dataframe;
mod error;
pub mod meta;
mod retry;
mod schema;
mod uri;
mod writer;

pub use adaptor::{mask_indices, AdaptorOptions, CxgAdaptor};
pub use array::{Compressed, DenseBlock, XArray, XLayout};
pub use backend::{LocalFsBackend, StorageBackend, GROUP_INDEX};
pub use backend_http::HttpBackend;
pub use context::{StoreConfig, StoreContext};
pub use dataframe::BOOL_CATEGORIES;
pub use error::{StoreError, StoreErrorCode};
pub use meta::{ApproxDistribution, CategoryColors, GeneSet, GeneSetGene, SchemaHint};
pub use retry::{is_transient_status, Attempt, RetryPolicy};
pub use schema::{Axis, AxisSchema, ColumnSchema, EmbeddingSchema, Schema};
pub use uri::{parse_store_uri, uri_join, StoreLocation};
pub use writer::CxgWriter;

pub const CRATE_NAME: &str = "cxg-store";

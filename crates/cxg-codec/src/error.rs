// SPDX-License-Identifier: Apache-2.0

use cxg_core::CxgError;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    BadMagic,
    UnsupportedVersion(u8),
    UnknownTypeCode(u8),
    Truncated { needed: usize, remaining: usize },
    TrailingBytes(usize),
    ColumnLength { column: usize, expected: usize, actual: usize },
    ColumnCount { expected: usize, actual: usize },
    ColIndexLength { expected: usize, actual: usize },
    InvalidCategoryCode { code: u32, categories: usize },
    SparseIndex { index: u32, size: usize },
    NonFinite(String),
    Binning(String),
    Json(String),
    TooLarge(usize),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic => write!(f, "buffer does not start with the matrix magic"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported matrix format version {v}"),
            Self::UnknownTypeCode(c) => write!(f, "unknown column type code {c}"),
            Self::Truncated { needed, remaining } => {
                write!(f, "truncated buffer: need {needed} bytes, {remaining} remain")
            }
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after last column"),
            Self::ColumnLength {
                column,
                expected,
                actual,
            } => write!(
                f,
                "column {column} has {actual} rows, header declares {expected}"
            ),
            Self::ColumnCount { expected, actual } => {
                write!(f, "expected {expected} columns, found {actual}")
            }
            Self::ColIndexLength { expected, actual } => {
                write!(f, "column index has {actual} entries, expected {expected}")
            }
            Self::InvalidCategoryCode { code, categories } => {
                write!(f, "category code {code} out of range for {categories} categories")
            }
            Self::SparseIndex { index, size } => {
                write!(f, "sparse index {index} out of range for size {size}")
            }
            Self::NonFinite(ctx) => write!(f, "non-finite value cannot be emitted as JSON: {ctx}"),
            Self::Binning(m) => write!(f, "binning: {m}"),
            Self::Json(m) => write!(f, "json column: {m}"),
            Self::TooLarge(n) => write!(f, "length {n} does not fit the wire format"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for CxgError {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::NonFinite(_) => CxgError::JsonEncoding(value.to_string()),
            other => CxgError::compute(other.to_string()),
        }
    }
}

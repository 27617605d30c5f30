// SPDX-License-Identifier: Apache-2.0

use cxg_core::CxgError;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreErrorCode {
    NotFound,
    Validation,
    Network,
    Io,
    Configuration,
    Closed,
    UnknownName,
    Unsupported,
}

impl StoreErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation_error",
            Self::Network => "network_error",
            Self::Io => "io_error",
            Self::Configuration => "configuration_error",
            Self::Closed => "closed",
            Self::UnknownName => "unknown_name",
            Self::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::NotFound, message)
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::Validation, message)
    }

    #[must_use]
    pub fn io(err: &std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(format!("{what}: {err}"))
        } else {
            Self::new(StoreErrorCode::Io, format!("{what}: {err}"))
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for StoreError {}

impl From<cxg_codec::CodecError> for StoreError {
    fn from(value: cxg_codec::CodecError) -> Self {
        Self::validation(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::validation(value.to_string())
    }
}

impl From<StoreError> for CxgError {
    fn from(value: StoreError) -> Self {
        match value.code {
            StoreErrorCode::NotFound => CxgError::not_found(value.message),
            StoreErrorCode::Configuration => CxgError::configuration(value.message),
            StoreErrorCode::Unsupported => CxgError::unsupported(value.message),
            StoreErrorCode::UnknownName => CxgError::filter(value.message),
            _ => CxgError::storage(value.to_string()),
        }
    }
}

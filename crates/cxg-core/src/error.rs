// SPDX-License-Identifier: Apache-2.0

use std::fmt;

pub type Result<T> = std::result::Result<T, CxgError>;

/// Why a dataset could not be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AccessReason {
    Unauthenticated,
    Forbidden,
    Storage,
}

impl AccessReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::Storage => "storage",
        }
    }
}

/// Identity of a withdrawn dataset, used to build the collection redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub collection_id: Option<String>,
    pub dataset_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CxgError {
    Configuration(String),
    DatasetNotFound(String),
    DatasetAccess {
        reason: AccessReason,
        message: String,
    },
    DatasetMetadata(String),
    Tombstone(Tombstone),
    Filter(String),
    ExceedsLimit(String),
    Compute(String),
    JsonEncoding(String),
    UnsupportedSummaryMethod(String),
    CacheExhausted(String),
    Unsupported(String),
}

impl CxgError {
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::DatasetNotFound(message.into())
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::DatasetAccess {
            reason: AccessReason::Forbidden,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::DatasetAccess {
            reason: AccessReason::Storage,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter(message.into())
    }

    #[must_use]
    pub fn exceeds_limit(message: impl Into<String>) -> Self {
        Self::ExceedsLimit(message.into())
    }

    #[must_use]
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute(message.into())
    }

    #[must_use]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Stable machine code, used in error bodies and metric labels.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::DatasetNotFound(_) => "DatasetNotFoundError",
            Self::DatasetAccess { .. } => "DatasetAccessError",
            Self::DatasetMetadata(_) => "DatasetMetadataError",
            Self::Tombstone(_) => "TombstoneError",
            Self::Filter(_) => "FilterError",
            Self::ExceedsLimit(_) => "ExceedsLimitError",
            Self::Compute(_) => "ComputeError",
            Self::JsonEncoding(_) => "JSONEncodingError",
            Self::UnsupportedSummaryMethod(_) => "UnsupportedSummaryMethod",
            Self::CacheExhausted(_) => "CacheExhausted",
            Self::Unsupported(_) => "Unsupported",
        }
    }

    /// Errors that describe the dataset itself rather than a transient
    /// condition. The cache manager stores these as negative entries.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DatasetNotFound(_) | Self::DatasetAccess { .. } | Self::Tombstone(_)
        )
    }

    #[must_use]
    pub const fn is_access_error(&self) -> bool {
        matches!(self, Self::DatasetAccess { .. })
    }
}

impl fmt::Display for CxgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(m)
            | Self::DatasetNotFound(m)
            | Self::DatasetMetadata(m)
            | Self::Filter(m)
            | Self::ExceedsLimit(m)
            | Self::Compute(m)
            | Self::JsonEncoding(m)
            | Self::UnsupportedSummaryMethod(m)
            | Self::CacheExhausted(m)
            | Self::Unsupported(m) => write!(f, "{}: {m}", self.code()),
            Self::DatasetAccess { reason, message } => {
                write!(f, "{} ({}): {message}", self.code(), reason.as_str())
            }
            Self::Tombstone(t) => write!(
                f,
                "{}: dataset {} of collection {} was withdrawn",
                self.code(),
                t.dataset_id.as_deref().unwrap_or("?"),
                t.collection_id.as_deref().unwrap_or("?")
            ),
        }
    }
}

impl std::error::Error for CxgError {}

impl From<serde_json::Error> for CxgError {
    fn from(value: serde_json::Error) -> Self {
        Self::JsonEncoding(value.to_string())
    }
}

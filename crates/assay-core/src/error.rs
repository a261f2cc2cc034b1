//! Error types for assay-core

use serde::Serialize;
use thiserror::Error;

/// Result type alias using assay-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in assay-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store could not start a transaction; later rows of a batch are not attempted
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Why a single pushed row was not applied.
///
/// These never abort a batch; each one is reported against its row so the
/// caller can decide whether to re-push it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    /// Unparseable payload or a missing/mistyped required field
    #[error("Malformed row: {0}")]
    MalformedRow(String),

    /// The row was tagged with an entity type this backend does not sync
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// The row's commit failed in the underlying store
    #[error("Transient store failure: {0}")]
    TransientStoreFailure(String),
}

/// Machine-readable tag for a [`RowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    MalformedRow,
    UnknownEntityType,
    TransientStoreFailure,
}

impl RowError {
    pub const fn kind(&self) -> RowErrorKind {
        match self {
            Self::MalformedRow(_) => RowErrorKind::MalformedRow,
            Self::UnknownEntityType(_) => RowErrorKind::UnknownEntityType,
            Self::TransientStoreFailure(_) => RowErrorKind::TransientStoreFailure,
        }
    }

    /// The detail message without the variant prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::MalformedRow(reason)
            | Self::UnknownEntityType(reason)
            | Self::TransientStoreFailure(reason) => reason,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRow(reason.into())
    }
}

impl From<Error> for RowError {
    fn from(error: Error) -> Self {
        Self::TransientStoreFailure(error.to_string())
    }
}

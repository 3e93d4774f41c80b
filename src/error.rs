//! Error types for the ingestion core.
//!
//! Errors are grouped by what the caller can do about them:
//!
//! - [`ErrorKind::Validation`]: the document was rejected before reaching the WAL.
//!   Resubmitting the same document fails the same way.
//! - [`ErrorKind::Durability`]: a WAL append or redo-log write failed. The whole
//!   submission may be retried.
//! - [`ErrorKind::Consumption`]: applying a merged batch to a segment writer
//!   failed. The consumer retries on its next cycle.
//! - [`ErrorKind::Placement`]: a rebalance attempt could not take its lock or
//!   reach the metadata store. It is retried on the next triggering event.
//! - [`ErrorKind::Recovery`]: the WAL could not be replayed on open. The shard
//!   must not serve.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Coarse category of a [`TesseraError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Durability,
    Consumption,
    Placement,
    Recovery,
    NotFound,
    InvalidArgument,
    Internal,
}

#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("durability error: {0}")]
    Durability(String),

    #[error("consumption error: {0}")]
    Consumption(String),

    #[error("placement error: {0}")]
    Placement(String),

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl TesseraError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        TesseraError::Validation(msg.into())
    }

    pub fn durability<S: Into<String>>(msg: S) -> Self {
        TesseraError::Durability(msg.into())
    }

    pub fn consumption<S: Into<String>>(msg: S) -> Self {
        TesseraError::Consumption(msg.into())
    }

    pub fn placement<S: Into<String>>(msg: S) -> Self {
        TesseraError::Placement(msg.into())
    }

    pub fn recovery<S: Into<String>>(msg: S) -> Self {
        TesseraError::Recovery(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        TesseraError::NotFound(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        TesseraError::InvalidArgument(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        TesseraError::Internal(msg.into())
    }

    /// Category of this error.
    ///
    /// Raw I/O and JSON errors count as durability failures: they only
    /// surface from the persistence paths.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::Validation(_) => ErrorKind::Validation,
            TesseraError::Durability(_) | TesseraError::Io(_) | TesseraError::Json(_) => {
                ErrorKind::Durability
            }
            TesseraError::Consumption(_) => ErrorKind::Consumption,
            TesseraError::Placement(_) => ErrorKind::Placement,
            TesseraError::Recovery(_) => ErrorKind::Recovery,
            TesseraError::NotFound(_) => ErrorKind::NotFound,
            TesseraError::InvalidArgument(_) | TesseraError::Config(_) => {
                ErrorKind::InvalidArgument
            }
            TesseraError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Durability | ErrorKind::Placement | ErrorKind::Consumption
        )
    }
}

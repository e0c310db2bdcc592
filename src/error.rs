//! Error types for the Mantis consensus system
//!
//! Structured error definitions use thiserror; anyhow errors coming from the
//! binary edge are folded into `MantisError::Other`.

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for Mantis operations
#[derive(Error, Debug)]
pub enum MantisError {
    /// Referenced user, model, record or entity is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Redundant creation (user already stored or already live)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The local solver could not be constructed
    #[error("Solver initialization failed: {0}")]
    SolverInit(String),

    /// A document store write failed or reported no change
    #[error("Store write failed: {0}")]
    StoreWrite(String),

    /// Backend database failure
    #[error("Database error: {0}")]
    Database(String),

    /// A persisted document does not have the expected shape
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Invalid identifier format
    #[error("Invalid id: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Mantis operations
pub type Result<T> = std::result::Result<T, MantisError>;

/// Convert anyhow::Error to MantisError
impl From<anyhow::Error> for MantisError {
    fn from(err: anyhow::Error) -> Self {
        MantisError::Other(err.to_string())
    }
}

impl From<libsql::Error> for MantisError {
    fn from(err: libsql::Error) -> Self {
        MantisError::Database(err.to_string())
    }
}

/// Collapse an operation result into a success flag.
///
/// Session manager operations log their own failures, so callers that only
/// need to decide between retry, skip or escalate can use this at the
/// boundary instead of matching on the error.
pub trait ResultExt {
    fn succeeded(self) -> bool;
}

impl<T> ResultExt for Result<T> {
    fn succeeded(self) -> bool {
        self.is_ok()
    }
}

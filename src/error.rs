//! Error types for CairnKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using CairnError
pub type Result<T> = std::result::Result<T, CairnError>;

/// Unified error type for CairnKV operations
#[derive(Debug, Error)]
pub enum CairnError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Data Model Errors
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Type mismatch on key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // -------------------------------------------------------------------------
    // Persistence Errors
    // -------------------------------------------------------------------------
    #[error("Persistence error in domain '{domain}': {source}")]
    PersistenceIo {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration / Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store is not connected")]
    NotReady,
}

impl From<serde_json::Error> for CairnError {
    fn from(err: serde_json::Error) -> Self {
        CairnError::Serialization(err.to_string())
    }
}

impl CairnError {
    /// Wrap an I/O error with the domain it happened in
    pub fn persistence(domain: &str, source: std::io::Error) -> Self {
        CairnError::PersistenceIo {
            domain: domain.to_string(),
            source,
        }
    }
}

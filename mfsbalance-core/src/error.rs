//! Error types for mfsbalance
//!
//! Provides a unified error type for mergerfs queries and shared helpers.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for mfsbalance operations
pub type Result<T> = std::result::Result<T, MfsError>;

/// Unified error type for mfsbalance
#[derive(Error, Debug)]
pub enum MfsError {
    // ===== Mount Errors =====
    #[error("{0} is not a mergerfs mount")]
    NotAMergedMount(PathBuf),

    #[error("Failed to read attribute {name} on {path}: {source}")]
    AttributeRead {
        path: PathBuf,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing attribute {name} on {path}")]
    MissingAttribute { path: PathBuf, name: String },

    // ===== Input Errors =====
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted")]
    Interrupted,
}

//! Error types shared across the pipeline
//!
//! Only operational failures are represented here. Contract violations by a
//! caller (unbalanced locks, overlapping read transactions) panic instead.

use std::io;

/// Error types for pipeline construction and output streams
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// An IO error occurred
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The configuration violates an invariant the pipeline relies on
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The configuration could not be parsed
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// A stream descriptor could not be understood
    #[error("invalid stream descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

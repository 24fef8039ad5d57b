//! Error types for the configuration store

use thiserror::Error;

/// Unified error type for configuration-tree operations
#[derive(Error, Debug)]
pub enum Error {
    /// A path that cannot name a node
    #[error("invalid topic path: {path}")]
    InvalidPath {
        /// The offending path text
        path: String,
    },

    /// A write addressed a leaf through an existing interior node, or vice versa
    #[error("node kind conflict at {path}")]
    NodeKindConflict {
        /// The path where the conflict occurred
        path: String,
    },

    /// Transaction-log line that could not be decoded
    #[error("corrupt transaction log at line {line}: {reason}")]
    CorruptLog {
        /// 1-based line number
        line: usize,
        /// Decode failure detail
        reason: String,
    },

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Snapshot (de)serialization failure
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_yaml::Error),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

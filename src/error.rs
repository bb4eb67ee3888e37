//! Error types for pipeline operations

use thiserror::Error;

/// Main error type for store, kernel and task operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A chunk required by a read is absent and `fill_missing` is off.
    #[error("Empty volume: chunk {key} does not exist")]
    EmptyVolume { key: String },

    #[error("Unaligned write: {bbox} is not chunk aligned at mip {mip}")]
    UnalignedWrite { bbox: String, mip: usize },

    #[error("Scale order error: {0}")]
    ScaleOrder(String),

    #[error("Relabel domain error: label {label} outside mapping of length {domain}")]
    RelabelDomain { label: u64, domain: usize },

    #[error("Manifest grouping error: {0}")]
    ManifestGrouping(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data type mismatch: layer holds {expected}, requested {requested}")]
    DataTypeMismatch { expected: String, requested: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

impl PipelineError {
    /// Whether retrying the failed task can never succeed.
    ///
    /// Malformed parameters are permanent; missing prerequisites and
    /// backend trouble are not.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::UnalignedWrite { .. }
                | PipelineError::ScaleOrder(_)
                | PipelineError::RelabelDomain { .. }
                | PipelineError::ManifestGrouping(_)
                | PipelineError::InvalidDimensions(_)
                | PipelineError::OutOfBounds(_)
                | PipelineError::DataTypeMismatch { .. }
                | PipelineError::InvalidTask(_)
        )
    }
}

/// Specialized Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

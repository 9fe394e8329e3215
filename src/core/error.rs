//! Error types for the accelerated SMO solver

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SVMError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("Invalid label: expected -1 or +1, got {0}")]
    InvalidLabel(f64),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Empty dataset")]
    EmptyDataset,

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device allocation failed: requested {requested} bytes, {available} bytes available")]
    DeviceAllocation { requested: usize, available: usize },

    #[error("Device pass failed in {operation}")]
    Dispatch { operation: String },

    #[error("Device transfer failed in {operation}: expected {expected} elements, got {actual}")]
    Transfer {
        operation: String,
        expected: usize,
        actual: usize,
    },

    #[error("No evictable cache node for column {column}")]
    CacheExhausted { column: usize },

    #[error("Bit vector index {index} is smaller than the last set index {last}")]
    BitVectorOrder { index: usize, last: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SVMError {
    /// Whether the error leaves device-resident state unusable.
    ///
    /// Everything raised by the device runtime, the column cache or the
    /// solver passes is fatal; only encoder ordering errors and host-side
    /// input problems can be reported and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SVMError::DeviceUnavailable(_)
                | SVMError::DeviceAllocation { .. }
                | SVMError::Dispatch { .. }
                | SVMError::Transfer { .. }
                | SVMError::CacheExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SVMError>;

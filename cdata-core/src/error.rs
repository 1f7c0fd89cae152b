//! Error types for array records

use thiserror::Error;

/// Result type for array record operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for array record operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer allocation failed
    #[error("Memory allocation of {bytes} bytes failed")]
    AllocationFailed {
        /// Requested size in bytes
        bytes: usize,
    },

    /// Buffer or element index outside the valid range
    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of addressable entries
        len: usize,
    },

    /// Release called on a record that was already released
    #[error("Record already released")]
    AlreadyReleased,

    /// A buffer required for the requested read is absent
    #[error("Buffer {index} is null")]
    NullBufferAccess {
        /// Buffer index
        index: usize,
    },

    /// Record fields disagree with the type layout or with each other
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Data type mismatch
    #[error("Data type mismatch: {0}")]
    TypeMismatch(String),

    /// Layout error (alignment, size, etc.)
    #[error("Memory layout error: {0}")]
    LayoutError(String),

    /// Memory budget exceeded
    #[error("Memory budget exceeded: requested {requested} bytes, available {available} bytes")]
    MemoryBudgetExceeded {
        /// Requested memory in bytes
        requested: usize,
        /// Available memory in bytes
        available: usize,
    },
}

impl Error {
    /// Whether this error was raised by an allocator rather than by validation
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            Error::AllocationFailed { .. } | Error::MemoryBudgetExceeded { .. }
        )
    }
}

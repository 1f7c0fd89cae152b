//! Columnar array records with exactly-once release
//!
//! This crate provides the owned record type that producers fill, the
//! `#[repr(C)]` exchange struct laid out per the Arrow C Data Interface, and
//! the import side that takes ownership of such a struct from a foreign
//! producer. Every record is released exactly once, either explicitly or when
//! it goes out of scope, and every buffer it owns goes back to the memory
//! pool it came from.

#![warn(missing_docs)]

pub mod access;
pub mod bitmap;
#[allow(unsafe_code)]
pub mod buffer;
pub mod datatype;
pub mod error;
#[allow(unsafe_code)]
pub mod ffi;
#[allow(unsafe_code)]
pub mod memory;
pub mod producer;
pub mod record;

// Re-export key types for convenience
pub use access::ArrayAccess;
pub use buffer::{Buffer, BufferView};
pub use datatype::{BufferKind, DataType, NativeType};
pub use error::{Error, Result};
pub use ffi::{FFI_ArrowArray, ImportedArray, ImportedChild, UNKNOWN_NULL_COUNT};
pub use producer::{random_seed, Producer, RandomProducer, SequenceProducer};
pub use record::{ArrayRecord, RecordParts, RecordState};

/// Memory pools and allocation accounting
pub mod pool {
    pub use crate::memory::default_pool;
    pub use crate::memory::BudgetedMemoryPool;
    pub use crate::memory::MemoryPool;
    pub use crate::memory::MemoryPoolStats;
    pub use crate::memory::SystemMemoryPool;
}

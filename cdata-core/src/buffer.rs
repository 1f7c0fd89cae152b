//! Owned, aligned memory buffers and borrowed views over them

use std::fmt;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::memory::{default_pool, MemoryPool};

/// Alignment for every buffer allocation (cache line / AVX-512 width)
pub const BUFFER_ALIGNMENT: usize = 64;

/// Buffer holding raw bytes, exclusively owned by one record
///
/// The allocation is returned to the originating pool when the buffer is
/// dropped. Buffers are never shared, so there is no reference counting:
/// ownership moves with the record that holds them.
pub struct Buffer {
    /// Pointer to the allocated memory
    ptr: NonNull<u8>,

    /// Size of the buffer in bytes
    len: usize,

    /// Memory pool this buffer was allocated from
    pool: Arc<dyn MemoryPool>,
}

impl Buffer {
    /// Create a zero-filled buffer of `len` bytes from the default pool
    pub fn new_zeroed(len: usize) -> Result<Self> {
        Self::new_zeroed_in(len, &default_pool())
    }

    /// Create a zero-filled buffer of `len` bytes from the given pool
    pub fn new_zeroed_in(len: usize, pool: &Arc<dyn MemoryPool>) -> Result<Self> {
        let ptr = pool.allocate(len, BUFFER_ALIGNMENT)?;

        Ok(Self {
            ptr,
            len,
            pool: Arc::clone(pool),
        })
    }

    /// Create a buffer of `len` bytes with every byte set to `byte`
    pub fn new_filled_in(len: usize, byte: u8, pool: &Arc<dyn MemoryPool>) -> Result<Self> {
        let mut buffer = Self::new_zeroed_in(len, pool)?;
        buffer.as_mut_slice().fill(byte);
        Ok(buffer)
    }

    /// Create a new buffer by copying the data from a slice
    pub fn from_slice<T: Pod>(data: &[T]) -> Result<Self> {
        Self::from_slice_in(data, &default_pool())
    }

    /// Create a new buffer by copying a slice into memory from the given pool
    pub fn from_slice_in<T: Pod>(data: &[T], pool: &Arc<dyn MemoryPool>) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = Self::new_zeroed_in(bytes.len(), pool)?;
        buffer.as_mut_slice().copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Get a pointer to the buffer data
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the buffer in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the buffer contents as bytes
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid for `len` bytes for as long as self lives
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable view of the buffer contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: ptr is valid for `len` bytes and uniquely owned
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Reinterpret the buffer as a slice of `T`
    pub fn typed<T: Pod>(&self) -> Result<&[T]> {
        cast_bytes(self.as_slice())
    }

    /// Reinterpret the buffer as a mutable slice of `T`
    pub fn typed_mut<T: Pod>(&mut self) -> Result<&mut [T]> {
        let len = self.len;
        bytemuck::try_cast_slice_mut(self.as_mut_slice()).map_err(|e| {
            Error::LayoutError(format!(
                "cannot view {len} bytes as {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Borrow this buffer as a read-only view
    pub fn view(&self) -> BufferView<'_> {
        BufferView::new(self.as_slice())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.deallocate(self.ptr, self.len, BUFFER_ALIGNMENT);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

// Safety: the buffer uniquely owns its allocation and only hands out
// references tied to its own borrows.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

/// Read-only view of a buffer, borrowed from the record that owns it
///
/// A view cannot outlive its record, and a record cannot be released while
/// a view is alive, so reads after release are ruled out at compile time.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BufferView<'a> {
    bytes: &'a [u8],
}

impl<'a> BufferView<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The viewed bytes
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Reinterpret the view as a slice of `T`
    pub fn typed<T: Pod>(&self) -> Result<&'a [T]> {
        cast_bytes(self.bytes)
    }

    /// Number of whole `T` elements the view can hold
    pub fn capacity_of<T>(&self) -> usize {
        self.bytes.len() / size_of::<T>().max(1)
    }
}

impl Deref for BufferView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl fmt::Debug for BufferView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn cast_bytes<T: Pod>(bytes: &[u8]) -> Result<&[T]> {
    bytemuck::try_cast_slice(bytes).map_err(|e| {
        Error::LayoutError(format!(
            "cannot view {} bytes as {}: {e}",
            bytes.len(),
            std::any::type_name::<T>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SystemMemoryPool;

    #[test]
    fn test_buffer_from_slice_is_aligned_and_typed() {
        let buffer = Buffer::from_slice(&[1i32, 2, 3, 4]).unwrap();
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.as_ptr() as usize % BUFFER_ALIGNMENT, 0);
        assert_eq!(buffer.typed::<i32>().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_buffer_returns_memory_on_drop() {
        let pool: Arc<dyn MemoryPool> = Arc::new(SystemMemoryPool::new());
        {
            let _a = Buffer::new_zeroed_in(100, &pool).unwrap();
            let _b = Buffer::new_filled_in(3, 0xFF, &pool).unwrap();
            assert_eq!(pool.usage_stats().current_bytes, 103);
        }
        let stats = pool.usage_stats();
        assert_eq!(stats.current_bytes, 0);
        assert_eq!(stats.allocation_count, 0);
    }

    #[test]
    fn test_view_rejects_ragged_cast() {
        let buffer = Buffer::from_slice(&[1u8, 2, 3]).unwrap();
        let err = buffer.view().typed::<u16>().unwrap_err();
        assert!(matches!(err, Error::LayoutError(_)));
        assert_eq!(buffer.view().capacity_of::<u16>(), 1);
    }

    #[test]
    fn test_typed_mut_writes_through() {
        let mut buffer = Buffer::new_zeroed(8).unwrap();
        buffer.typed_mut::<i32>().unwrap()[1] = 7;
        assert_eq!(buffer.as_slice(), &[0, 0, 0, 0, 7, 0, 0, 0]);
    }
}

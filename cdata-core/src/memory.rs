//! Memory pools backing record buffers
//!
//! Every [`Buffer`](crate::buffer::Buffer) remembers the pool it came from and
//! hands its allocation back on drop, so pool statistics double as a leak
//! check: once every record built from a pool is released, `current_bytes`
//! and `allocation_count` are back to zero.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

/// Interface for memory pool implementations
pub trait MemoryPool: Send + Sync {
    /// Allocate zeroed memory with the given size and alignment
    fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>>;

    /// Deallocate memory previously returned by [`MemoryPool::allocate`]
    /// with the same size and alignment
    fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize);

    /// Get memory usage statistics for this pool
    fn usage_stats(&self) -> MemoryPoolStats;
}

/// Memory usage statistics for a memory pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPoolStats {
    /// Total allocated memory in bytes
    pub allocated_bytes: usize,

    /// Total deallocated memory in bytes
    pub deallocated_bytes: usize,

    /// Current outstanding allocations in bytes
    pub current_bytes: usize,

    /// Peak memory usage in bytes
    pub peak_bytes: usize,

    /// Number of active allocations
    pub allocation_count: usize,

    /// Total number of allocations performed
    pub total_allocations: usize,

    /// Total number of deallocations performed
    pub total_deallocations: usize,
}

/// Lock-free counters behind [`MemoryPoolStats`]
#[derive(Debug, Default)]
struct PoolCounters {
    allocated_bytes: AtomicUsize,
    deallocated_bytes: AtomicUsize,
    current_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocation_count: AtomicUsize,
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
}

impl PoolCounters {
    fn record_allocation(&self, size: usize) {
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        let current = self.current_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(current, Ordering::Relaxed);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_deallocation(&self, size: usize) {
        self.deallocated_bytes.fetch_add(size, Ordering::Relaxed);
        self.current_bytes.fetch_sub(size, Ordering::Relaxed);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MemoryPoolStats {
        MemoryPoolStats {
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            deallocated_bytes: self.deallocated_bytes.load(Ordering::Relaxed),
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
        }
    }
}

/// Default system memory pool that uses the global allocator
#[derive(Debug, Default)]
pub struct SystemMemoryPool {
    counters: PoolCounters,
}

impl SystemMemoryPool {
    /// Create a new system memory pool
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryPool for SystemMemoryPool {
    fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        // zero-sized layouts are not allowed by the global allocator
        let layout = Layout::from_size_align(size.max(1), alignment)
            .map_err(|_| Error::AllocationFailed { bytes: size })?;

        // Safety: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::AllocationFailed { bytes: size })?;

        self.counters.record_allocation(size);
        Ok(ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let Ok(layout) = Layout::from_size_align(size.max(1), alignment) else {
            tracing::warn!(size, alignment, "deallocate called with an invalid layout; leaking");
            return;
        };

        // Safety: ptr was produced by `allocate` with this exact layout
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }

        self.counters.record_deallocation(size);
    }

    fn usage_stats(&self) -> MemoryPoolStats {
        self.counters.snapshot()
    }
}

/// A pool that forwards to an inner pool while enforcing a byte budget
///
/// Useful for bounding the memory a producer may pin, and for exercising the
/// allocation-failure paths of record construction.
pub struct BudgetedMemoryPool {
    /// The total memory budget in bytes
    total_budget: usize,

    /// Bytes currently charged against the budget
    current_usage: AtomicUsize,

    inner: Arc<dyn MemoryPool>,
}

impl BudgetedMemoryPool {
    /// Create a budgeted pool on top of a fresh [`SystemMemoryPool`]
    pub fn new(total_budget: usize) -> Self {
        Self::with_inner(total_budget, Arc::new(SystemMemoryPool::new()))
    }

    /// Create a budgeted pool on top of an existing pool
    pub fn with_inner(total_budget: usize, inner: Arc<dyn MemoryPool>) -> Self {
        Self {
            total_budget,
            current_usage: AtomicUsize::new(0),
            inner,
        }
    }

    /// Bytes currently charged against the budget
    pub fn usage(&self) -> usize {
        self.current_usage.load(Ordering::SeqCst)
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.total_budget.saturating_sub(self.usage())
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        let mut current = self.current_usage.load(Ordering::SeqCst);

        loop {
            if current + bytes > self.total_budget {
                return false;
            }

            match self.current_usage.compare_exchange(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl MemoryPool for BudgetedMemoryPool {
    fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !self.try_reserve(size) {
            return Err(Error::MemoryBudgetExceeded {
                requested: size,
                available: self.available(),
            });
        }

        self.inner.allocate(size, alignment).inspect_err(|_| {
            self.current_usage.fetch_sub(size, Ordering::SeqCst);
        })
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        self.inner.deallocate(ptr, size, alignment);
        let prev = self.current_usage.fetch_sub(size, Ordering::SeqCst);

        debug_assert!(
            prev >= size,
            "Attempted to release more memory than allocated: prev={prev}, release={size}"
        );
    }

    fn usage_stats(&self) -> MemoryPoolStats {
        self.inner.usage_stats()
    }
}

/// Process-wide pool used when no explicit pool is supplied
pub fn default_pool() -> Arc<dyn MemoryPool> {
    static DEFAULT: OnceLock<Arc<SystemMemoryPool>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(SystemMemoryPool::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_pool_tracks_outstanding_bytes() {
        let pool = SystemMemoryPool::new();
        let a = pool.allocate(128, 64).unwrap();
        let b = pool.allocate(32, 64).unwrap();

        let stats = pool.usage_stats();
        assert_eq!(stats.current_bytes, 160);
        assert_eq!(stats.allocation_count, 2);

        pool.deallocate(a, 128, 64);
        pool.deallocate(b, 32, 64);

        let stats = pool.usage_stats();
        assert_eq!(stats.current_bytes, 0);
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.peak_bytes, 160);
        assert_eq!(stats.total_deallocations, 2);
    }

    #[test]
    fn test_system_pool_zero_sized_allocation() {
        let pool = SystemMemoryPool::new();
        let ptr = pool.allocate(0, 64).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        pool.deallocate(ptr, 0, 64);
        assert_eq!(pool.usage_stats().allocation_count, 0);
    }

    #[test]
    fn test_system_pool_unrepresentable_size() {
        let pool = SystemMemoryPool::new();
        let err = pool.allocate(usize::MAX, 64).unwrap_err();
        assert_eq!(err, Error::AllocationFailed { bytes: usize::MAX });
        assert_eq!(pool.usage_stats().total_allocations, 0);
    }

    #[test]
    fn test_budgeted_pool_rejects_over_budget() {
        let pool = BudgetedMemoryPool::new(100);
        let ptr = pool.allocate(60, 64).unwrap();

        let err = pool.allocate(60, 64).unwrap_err();
        assert_eq!(
            err,
            Error::MemoryBudgetExceeded {
                requested: 60,
                available: 40
            }
        );

        pool.deallocate(ptr, 60, 64);
        assert_eq!(pool.usage(), 0);
        assert!(pool.allocate(100, 64).is_ok_and(|p| {
            pool.deallocate(p, 100, 64);
            true
        }));
    }
}

//! # Buffer Allocator
//!
//! Purpose: Hand out and take back the small scratch buffers requests encode
//! their header and extras into.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: `PooledAllocator` keeps a bounded free list so
//!    steady-state traffic allocates nothing per request.
//! 2. **Minimal Locking**: The mutex is held only to push or pop a buffer.
//! 3. **Zeroed On Take**: Callers may rely on untouched bytes being zero.

use parking_lot::Mutex;

/// Default size of pooled scratch buffers (header plus the largest extras).
pub const DEFAULT_SLOT_SIZE: usize = 64;

/// Default number of idle buffers kept by `PooledAllocator`.
pub const DEFAULT_MAX_FREE: usize = 256;

/// Source of scratch buffers.
pub trait BufferAllocator: Send + Sync {
    /// Returns a zeroed buffer of exactly `size` bytes.
    fn take(&self, size: usize) -> Vec<u8>;

    /// Gives a buffer back once the caller is done with it.
    fn give_back(&self, buffer: Vec<u8>);
}

/// Allocates fresh buffers and drops returned ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn take(&self, size: usize) -> Vec<u8> {
        vec![0; size]
    }

    fn give_back(&self, _buffer: Vec<u8>) {}
}

/// Bounded free list of fixed-size buffers.
#[derive(Debug)]
pub struct PooledAllocator {
    slot_size: usize,
    max_free: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl PooledAllocator {
    pub fn new(slot_size: usize, max_free: usize) -> Self {
        PooledAllocator {
            slot_size,
            max_free,
            free: Mutex::new(Vec::with_capacity(max_free)),
        }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_SIZE, DEFAULT_MAX_FREE)
    }
}

impl BufferAllocator for PooledAllocator {
    fn take(&self, size: usize) -> Vec<u8> {
        if size > self.slot_size {
            return vec![0; size];
        }

        let mut buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.slot_size));
        buffer.clear();
        buffer.resize(size, 0);
        buffer
    }

    fn give_back(&self, buffer: Vec<u8>) {
        if buffer.capacity() < self.slot_size {
            return;
        }

        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_reuses_buffers() {
        let allocator = PooledAllocator::new(32, 2);
        let mut buffer = allocator.take(24);
        assert_eq!(buffer.len(), 24);
        buffer[0] = 0xff;
        let ptr = buffer.as_ptr();
        allocator.give_back(buffer);
        assert_eq!(allocator.idle(), 1);

        let again = allocator.take(28);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again.len(), 28);
        assert!(again.iter().all(|&b| b == 0));
        assert_eq!(allocator.idle(), 0);
    }

    #[test]
    fn test_pooled_bounds_free_list() {
        let allocator = PooledAllocator::new(16, 1);
        let first = allocator.take(16);
        let second = allocator.take(16);
        allocator.give_back(first);
        allocator.give_back(second);
        assert_eq!(allocator.idle(), 1);
    }

    #[test]
    fn test_oversized_requests_bypass_pool() {
        let allocator = PooledAllocator::new(16, 4);
        let big = allocator.take(100);
        assert_eq!(big.len(), 100);
        allocator.give_back(vec![0; 4]);
        assert_eq!(allocator.idle(), 0);
    }
}

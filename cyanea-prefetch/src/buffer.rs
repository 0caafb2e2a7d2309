//! Physical buffer storage and the free-index pool that hands it out.
//!
//! Buffers are allocated once, up front, and addressed by index. Which
//! logical slot currently owns which index is decided by the index tables
//! in [`crate::buffer_index`] and [`crate::prefetch_index`].

use std::ops::Range;

use cyanea_core::{CyaneaError, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stack of free physical buffer indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPool {
    free: Vec<usize>,
}

impl BufferPool {
    /// Pool holding every index in `range`; the lowest index is handed out first.
    pub fn with_range(range: Range<usize>) -> Self {
        Self {
            free: range.rev().collect(),
        }
    }

    /// Take a free index.
    ///
    /// # Errors
    ///
    /// An empty pool means the tables were used outside their sizing
    /// contract, so this is an invariant violation.
    pub fn acquire(&mut self) -> Result<usize> {
        self.free
            .pop()
            .ok_or_else(|| CyaneaError::invariant("free buffer pool is exhausted"))
    }

    /// Return an index to the pool.
    pub fn release(&mut self, index: usize) {
        debug_assert!(!self.free.contains(&index), "index {} released twice", index);
        self.free.push(index);
    }

    /// Number of free indices.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.free.contains(&index)
    }
}

/// Fixed-capacity set of physical buffers, each behind its own lock.
///
/// Lanes evaluated in parallel write only to buffers they flipped, and read
/// shared ones, so per-buffer locks never contend on a write.
#[derive(Debug)]
pub struct BufferArena<T> {
    buffers: Vec<RwLock<T>>,
}

impl<T> BufferArena<T> {
    /// Allocate `count` buffers, building each with `init`.
    pub fn from_fn(count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            buffers: (0..count).map(|i| RwLock::new(init(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn read(&self, index: usize) -> RwLockReadGuard<'_, T> {
        self.buffers[index].read()
    }

    pub fn write(&self, index: usize) -> RwLockWriteGuard<'_, T> {
        self.buffers[index].write()
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        self.buffers[index].get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_lowest_first() {
        let mut pool = BufferPool::with_range(4..7);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.acquire().unwrap(), 4);
        assert_eq!(pool.acquire().unwrap(), 5);
        pool.release(4);
        assert_eq!(pool.acquire().unwrap(), 4);
        assert_eq!(pool.acquire().unwrap(), 6);
        let err = pool.acquire().unwrap_err();
        assert!(err.is_invariant());
    }

    #[test]
    fn arena_locks_are_independent() {
        let arena = BufferArena::from_fn(3, |i| vec![i as f64; 2]);
        let mut w = arena.write(1);
        w[0] = 9.0;
        // a different buffer is still readable while 1 is held for writing
        assert_eq!(arena.read(0)[0], 0.0);
        drop(w);
        assert_eq!(arena.read(1)[0], 9.0);
        assert_eq!(arena.len(), 3);
    }
}

//! Single-lane buffer index table with flip-on-write and one checkpoint.
//!
//! Logical slots below `min_index` are static and map to themselves. Every
//! other slot starts on its own physical index and may be moved to a fresh
//! index from the free pool by [`BufferIndexTable::flip`]; the previous
//! index stays untouched while the checkpoint still refers to it.

use cyanea_core::{Checkpointed, CyaneaError, Result};
use tracing::trace;

use crate::buffer::BufferPool;

#[derive(Debug, Clone)]
struct Checkpoint {
    mapping: Vec<usize>,
    pool: BufferPool,
}

/// Versioned mapping from logical slot to physical buffer index.
#[derive(Debug, Clone)]
pub struct BufferIndexTable {
    min_index: usize,
    mapping: Vec<usize>,
    flipped: Vec<bool>,
    pool: BufferPool,
    checkpoint: Option<Checkpoint>,
}

impl BufferIndexTable {
    /// Table over `slot_count` slots, the first `min_index` of them static.
    ///
    /// Allocates `min_index + 2 * (slot_count - min_index)` physical indices:
    /// one per slot plus one spare per non-static slot, enough for every
    /// slot to be flipped once between checkpoints.
    pub fn new(slot_count: usize, min_index: usize) -> Result<Self> {
        if min_index > slot_count {
            return Err(CyaneaError::InvalidInput(format!(
                "min index {} exceeds slot count {}",
                min_index, slot_count
            )));
        }
        let dynamic = slot_count - min_index;
        Ok(Self {
            min_index,
            mapping: (0..slot_count).collect(),
            flipped: vec![false; slot_count],
            pool: BufferPool::with_range(slot_count..slot_count + dynamic),
            checkpoint: None,
        })
    }

    /// Number of physical buffers the caller must allocate.
    pub fn physical_count(&self) -> usize {
        self.mapping.len() + (self.mapping.len() - self.min_index)
    }

    pub fn slot_count(&self) -> usize {
        self.mapping.len()
    }

    pub fn min_index(&self) -> usize {
        self.min_index
    }

    /// Current physical index of `slot`.
    pub fn buffer_index(&self, slot: usize) -> usize {
        self.mapping[slot]
    }

    /// True if `slot` was flipped since the last store or restore.
    pub fn is_flipped(&self, slot: usize) -> bool {
        self.flipped[slot]
    }

    pub fn free_count(&self) -> usize {
        self.pool.available()
    }

    /// Move `slot` onto a fresh physical index and return it.
    ///
    /// # Errors
    ///
    /// Flipping a static slot, flipping a slot twice between checkpoints,
    /// or running the pool dry are all invariant violations.
    pub fn flip(&mut self, slot: usize) -> Result<usize> {
        self.check_dynamic(slot)?;
        if self.flipped[slot] {
            return Err(CyaneaError::invariant(format!(
                "slot {} flipped twice before a checkpoint",
                slot
            )));
        }
        let fresh = self.pool.acquire()?;
        let old = std::mem::replace(&mut self.mapping[slot], fresh);
        if self.checkpoint.is_none() {
            // nothing else can refer to the old buffer
            self.pool.release(old);
        }
        self.flipped[slot] = true;
        trace!(slot, old, fresh, "flipped buffer slot");
        Ok(fresh)
    }

    /// Flip `slot` unless that already happened since the last checkpoint.
    pub fn ensure_flipped(&mut self, slot: usize) -> Result<usize> {
        if self.flipped.get(slot).copied().unwrap_or(false) {
            Ok(self.mapping[slot])
        } else {
            self.flip(slot)
        }
    }

    fn check_dynamic(&self, slot: usize) -> Result<()> {
        if slot >= self.mapping.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "slot {} out of range ({})",
                slot,
                self.mapping.len()
            )));
        }
        if slot < self.min_index {
            return Err(CyaneaError::invariant(format!(
                "slot {} is static (min index {})",
                slot, self.min_index
            )));
        }
        Ok(())
    }
}

impl Checkpointed for BufferIndexTable {
    /// Snapshot the mapping and the pool.
    ///
    /// Buffers that only the previous checkpoint still referenced go back to
    /// the pool first.
    fn store_state(&mut self) -> Result<()> {
        if let Some(previous) = &self.checkpoint {
            for slot in self.min_index..self.mapping.len() {
                if self.flipped[slot] {
                    self.pool.release(previous.mapping[slot]);
                }
            }
        }
        self.flipped.iter_mut().for_each(|f| *f = false);
        self.checkpoint = Some(Checkpoint {
            mapping: self.mapping.clone(),
            pool: self.pool.clone(),
        });
        Ok(())
    }

    /// Swap the live mapping and pool back to the checkpoint and consume it.
    fn restore_state(&mut self) -> Result<()> {
        let checkpoint = self
            .checkpoint
            .take()
            .ok_or_else(|| CyaneaError::invariant("restore without a matching store"))?;
        self.mapping = checkpoint.mapping;
        self.pool = checkpoint.pool;
        self.flipped.iter_mut().for_each(|f| *f = false);
        Ok(())
    }

    fn has_checkpoint(&self) -> bool {
        self.checkpoint.is_some()
    }
}

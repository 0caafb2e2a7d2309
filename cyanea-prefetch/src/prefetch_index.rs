//! N-lane buffer index table for speculative evaluation.
//!
//! Every lane starts a round with a copy of the canonical mapping. A lane
//! that writes a slot first flips it onto a fresh index from the shared
//! pool, so two lanes either share an untouched buffer or own disjoint ones.
//! Accepting a lane promotes its mapping to canonical and hands every other
//! lane's fresh indices back to the pool; rejecting every lane restores the
//! pool snapshot taken when the round opened.
//!
//! Two checkpoint levels exist:
//!
//! - the round snapshot, taken by [`PrefetchIndexTable::open_round`] and
//!   restored by [`PrefetchIndexTable::reject_all`];
//! - the chain checkpoint, managed through [`Checkpointed`], which an MCMC
//!   chain uses to roll back a whole accepted proposal.
//!
//! Canonical indices replaced by an accept while the chain checkpoint still
//! points at them are retired, not freed, until the next store.

use cyanea_core::{Checkpointed, CyaneaError, Result};
use tracing::trace;

use crate::buffer::BufferPool;

/// Where the table is in the round lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    /// No round has been opened since the last accept, reject or checkpoint.
    Idle,
    /// Lanes may flip slots.
    Open,
    /// The given lane was promoted; no further accept is allowed.
    Accepted(usize),
}

#[derive(Debug, Clone)]
struct ChainCheckpoint {
    mapping: Vec<usize>,
    pool: BufferPool,
}

/// Slot-to-buffer mapping shared by `N` prefetch lanes.
#[derive(Debug, Clone)]
pub struct PrefetchIndexTable {
    min_index: usize,
    canonical: Vec<usize>,
    lanes: Vec<Vec<usize>>,
    flipped: Vec<Vec<bool>>,
    pool: BufferPool,
    round_pool: Option<BufferPool>,
    retired: Vec<usize>,
    chain: Option<ChainCheckpoint>,
    status: RoundStatus,
}

impl PrefetchIndexTable {
    /// Table over `slot_count` slots for `lane_count` lanes; slots below
    /// `min_index` are static.
    ///
    /// The pool holds `(lane_count + 1)` spare indices per non-static slot:
    /// one per lane for its fresh copy and one for a buffer retired while
    /// the chain checkpoint still refers to it.
    pub fn new(slot_count: usize, min_index: usize, lane_count: usize) -> Result<Self> {
        if lane_count == 0 {
            return Err(CyaneaError::InvalidInput("at least one lane is required".into()));
        }
        if min_index > slot_count {
            return Err(CyaneaError::InvalidInput(format!(
                "min index {} exceeds slot count {}",
                min_index, slot_count
            )));
        }
        let spare = (lane_count + 1) * (slot_count - min_index);
        let canonical: Vec<usize> = (0..slot_count).collect();
        Ok(Self {
            min_index,
            lanes: vec![canonical.clone(); lane_count],
            flipped: vec![vec![false; slot_count]; lane_count],
            canonical,
            pool: BufferPool::with_range(slot_count..slot_count + spare),
            round_pool: None,
            retired: Vec::new(),
            chain: None,
            status: RoundStatus::Idle,
        })
    }

    /// Number of physical buffers the caller must allocate.
    pub fn physical_count(&self) -> usize {
        let dynamic = self.canonical.len() - self.min_index;
        self.canonical.len() + (self.lanes.len() + 1) * dynamic
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn slot_count(&self) -> usize {
        self.canonical.len()
    }

    pub fn min_index(&self) -> usize {
        self.min_index
    }

    pub fn status(&self) -> RoundStatus {
        self.status
    }

    pub fn free_count(&self) -> usize {
        self.pool.available()
    }

    /// Physical index lane `lane` reads for `slot`.
    pub fn buffer_index(&self, lane: usize, slot: usize) -> usize {
        self.lanes[lane][slot]
    }

    /// Committed physical index of `slot`.
    pub fn canonical_index(&self, slot: usize) -> usize {
        self.canonical[slot]
    }

    /// True if `lane` owns a private buffer for `slot` this round.
    pub fn is_flipped(&self, lane: usize, slot: usize) -> bool {
        self.flipped[lane][slot]
    }

    /// Start a round; does nothing if one is already open.
    pub fn open_round(&mut self) {
        if self.status != RoundStatus::Open {
            self.round_pool = Some(self.pool.clone());
            self.status = RoundStatus::Open;
            trace!(free = self.pool.available(), "opened prefetch round");
        }
    }

    /// Give `slot` a private buffer in `lane` and return its index.
    ///
    /// # Errors
    ///
    /// Invariant violations: no open round, an unknown lane, a static slot,
    /// or a slot this lane already flipped during the round. The pool is
    /// sized for one flip per slot per lane, so a second flip is refused
    /// rather than allowed to eat another lane's spare.
    pub fn flip(&mut self, lane: usize, slot: usize) -> Result<usize> {
        if self.status != RoundStatus::Open {
            return Err(CyaneaError::invariant("flip outside an open prefetch round"));
        }
        self.check_lane(lane)?;
        self.check_dynamic(slot)?;
        if self.flipped[lane][slot] {
            return Err(CyaneaError::invariant(format!(
                "lane {} flipped slot {} twice in one round",
                lane, slot
            )));
        }
        let fresh = self.pool.acquire()?;
        self.lanes[lane][slot] = fresh;
        self.flipped[lane][slot] = true;
        trace!(lane, slot, fresh, "flipped lane slot");
        Ok(fresh)
    }

    /// The lane's private buffer for `slot`, flipping on first use.
    pub fn ensure_flipped(&mut self, lane: usize, slot: usize) -> Result<usize> {
        self.check_lane(lane)?;
        if self.flipped[lane].get(slot).copied().unwrap_or(false) {
            Ok(self.lanes[lane][slot])
        } else {
            self.flip(lane, slot)
        }
    }

    /// Promote `lane` to canonical and reclaim every other lane's buffers.
    ///
    /// # Errors
    ///
    /// Accepting with no open round or a second time in the same round.
    pub fn accept(&mut self, lane: usize) -> Result<()> {
        self.check_lane(lane)?;
        match self.status {
            RoundStatus::Open => {}
            RoundStatus::Accepted(previous) => {
                return Err(CyaneaError::invariant(format!(
                    "lane {} accepted after lane {} in the same round",
                    lane, previous
                )))
            }
            RoundStatus::Idle => {
                return Err(CyaneaError::invariant(format!(
                    "lane {} accepted with no open round",
                    lane
                )))
            }
        }

        for slot in self.min_index..self.canonical.len() {
            if self.flipped[lane][slot] {
                let old = std::mem::replace(&mut self.canonical[slot], self.lanes[lane][slot]);
                let referenced = self
                    .chain
                    .as_ref()
                    .map_or(false, |cp| cp.mapping[slot] == old);
                if referenced {
                    self.retired.push(old);
                } else {
                    self.pool.release(old);
                }
            }
            for other in 0..self.lanes.len() {
                if other != lane && self.flipped[other][slot] {
                    self.pool.release(self.lanes[other][slot]);
                }
            }
        }
        self.reset_lanes();
        self.round_pool = None;
        self.status = RoundStatus::Accepted(lane);
        trace!(lane, free = self.pool.available(), retired = self.retired.len(), "accepted lane");
        Ok(())
    }

    /// Discard every lane's round work.
    ///
    /// A no-op when no round is open.
    ///
    /// # Errors
    ///
    /// Rejecting after a lane of the same round was accepted.
    pub fn reject_all(&mut self) -> Result<()> {
        match self.status {
            RoundStatus::Idle => Ok(()),
            RoundStatus::Accepted(lane) => Err(CyaneaError::invariant(format!(
                "reject after lane {} was accepted",
                lane
            ))),
            RoundStatus::Open => {
                if let Some(pool) = self.round_pool.take() {
                    self.pool = pool;
                }
                self.reset_lanes();
                self.status = RoundStatus::Idle;
                trace!(free = self.pool.available(), "rejected all lanes");
                Ok(())
            }
        }
    }

    /// Return lane `lane` to the canonical mapping, freeing its flips.
    ///
    /// Used when a lane's evaluation is rerun from scratch within a round.
    pub fn reset_lane(&mut self, lane: usize) -> Result<()> {
        self.check_lane(lane)?;
        for slot in self.min_index..self.canonical.len() {
            if self.flipped[lane][slot] {
                self.pool.release(self.lanes[lane][slot]);
                self.lanes[lane][slot] = self.canonical[slot];
                self.flipped[lane][slot] = false;
            }
        }
        Ok(())
    }

    fn reset_lanes(&mut self) {
        for (mapping, flipped) in self.lanes.iter_mut().zip(self.flipped.iter_mut()) {
            mapping.copy_from_slice(&self.canonical);
            flipped.iter_mut().for_each(|f| *f = false);
        }
    }

    fn check_lane(&self, lane: usize) -> Result<()> {
        if lane >= self.lanes.len() {
            return Err(CyaneaError::invariant(format!(
                "lane {} out of range ({} lanes)",
                lane,
                self.lanes.len()
            )));
        }
        Ok(())
    }

    fn check_dynamic(&self, slot: usize) -> Result<()> {
        if slot >= self.canonical.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "slot {} out of range ({})",
                slot,
                self.canonical.len()
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

    fn ensure_between_rounds(&self, what: &str) -> Result<()> {
        if self.status == RoundStatus::Open {
            return Err(CyaneaError::invariant(format!(
                "{} while a prefetch round is open",
                what
            )));
        }
        Ok(())
    }
}

impl Checkpointed for PrefetchIndexTable {
    fn store_state(&mut self) -> Result<()> {
        self.ensure_between_rounds("store")?;
        for index in self.retired.drain(..) {
            self.pool.release(index);
        }
        self.chain = Some(ChainCheckpoint {
            mapping: self.canonical.clone(),
            pool: self.pool.clone(),
        });
        self.status = RoundStatus::Idle;
        Ok(())
    }

    fn restore_state(&mut self) -> Result<()> {
        self.ensure_between_rounds("restore")?;
        let checkpoint = self
            .chain
            .take()
            .ok_or_else(|| CyaneaError::invariant("restore without a matching store"))?;
        self.canonical = checkpoint.mapping;
        self.pool = checkpoint.pool;
        self.retired.clear();
        self.reset_lanes();
        self.status = RoundStatus::Idle;
        Ok(())
    }

    fn has_checkpoint(&self) -> bool {
        self.chain.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(table: &PrefetchIndexTable, lane: usize) -> Vec<usize> {
        (0..table.slot_count()).map(|s| table.buffer_index(lane, s)).collect()
    }

    fn canonical(table: &PrefetchIndexTable) -> Vec<usize> {
        (0..table.slot_count()).map(|s| table.canonical_index(s)).collect()
    }

    #[test]
    fn sizing_covers_every_lane_flipping_every_slot() {
        let table = PrefetchIndexTable::new(5, 2, 3).unwrap();
        assert_eq!(table.free_count(), 12);
        assert_eq!(table.physical_count(), 17);
        assert!(PrefetchIndexTable::new(5, 2, 0).is_err());
    }

    #[test]
    fn flip_requires_open_round_and_dynamic_slot() {
        let mut table = PrefetchIndexTable::new(4, 1, 2).unwrap();
        assert!(table.flip(0, 2).unwrap_err().is_invariant());
        table.open_round();
        assert!(table.flip(0, 0).unwrap_err().is_invariant());
        assert!(table.flip(5, 2).unwrap_err().is_invariant());
        table.flip(0, 2).unwrap();
        assert!(table.flip(0, 2).unwrap_err().is_invariant());
        assert_eq!(table.ensure_flipped(0, 2).unwrap(), table.buffer_index(0, 2));
    }

    #[test]
    fn lanes_share_until_flipped() {
        let mut table = PrefetchIndexTable::new(4, 1, 2).unwrap();
        table.open_round();
        assert_eq!(table.buffer_index(0, 3), table.buffer_index(1, 3));
        table.flip(0, 3).unwrap();
        assert_ne!(table.buffer_index(0, 3), table.buffer_index(1, 3));
        assert_eq!(table.buffer_index(1, 3), table.canonical_index(3));
    }

    #[test]
    fn accept_promotes_lane_and_reclaims_others() {
        let mut table = PrefetchIndexTable::new(4, 1, 3).unwrap();
        let free = table.free_count();
        table.open_round();
        table.flip(0, 1).unwrap();
        table.flip(1, 2).unwrap();
        table.flip(1, 3).unwrap();
        table.flip(2, 2).unwrap();
        let winner = mapping(&table, 1);
        table.accept(1).unwrap();
        assert_eq!(canonical(&table), winner);
        for lane in 0..3 {
            assert_eq!(mapping(&table, lane), winner);
        }
        assert_eq!(table.free_count(), free);
        assert_eq!(table.status(), RoundStatus::Accepted(1));
    }

    #[test]
    fn second_accept_and_accept_without_round_fail() {
        let mut table = PrefetchIndexTable::new(3, 0, 2).unwrap();
        assert!(table.accept(0).unwrap_err().is_invariant());
        table.open_round();
        table.accept(0).unwrap();
        assert!(table.accept(1).unwrap_err().is_invariant());
        assert!(table.reject_all().unwrap_err().is_invariant());
    }

    #[test]
    fn reject_all_restores_round_snapshot() {
        let mut table = PrefetchIndexTable::new(4, 1, 2).unwrap();
        let before = canonical(&table);
        let free = table.free_count();
        table.reject_all().unwrap();
        table.open_round();
        table.flip(0, 1).unwrap();
        table.flip(1, 1).unwrap();
        table.flip(1, 2).unwrap();
        table.reject_all().unwrap();
        assert_eq!(canonical(&table), before);
        assert_eq!(mapping(&table, 0), before);
        assert_eq!(mapping(&table, 1), before);
        assert_eq!(table.free_count(), free);
        assert_eq!(table.status(), RoundStatus::Idle);
    }

    #[test]
    fn store_and_restore_refused_mid_round() {
        let mut table = PrefetchIndexTable::new(3, 0, 2).unwrap();
        table.open_round();
        assert!(table.store_state().unwrap_err().is_invariant());
        table.reject_all().unwrap();
        table.store_state().unwrap();
        table.open_round();
        assert!(table.restore_state().unwrap_err().is_invariant());
    }

    #[test]
    fn chain_restore_undoes_accepted_rounds() {
        let mut table = PrefetchIndexTable::new(4, 1, 2).unwrap();
        table.store_state().unwrap();
        let stored = canonical(&table);
        let free = table.free_count();
        for _ in 0..3 {
            table.open_round();
            table.flip(0, 2).unwrap();
            table.flip(1, 3).unwrap();
            table.accept(0).unwrap();
        }
        assert_ne!(canonical(&table), stored);
        table.restore_state().unwrap();
        assert_eq!(canonical(&table), stored);
        assert_eq!(mapping(&table, 1), stored);
        assert_eq!(table.free_count(), free);
        assert!(!table.has_checkpoint());
        assert!(table.restore_state().unwrap_err().is_invariant());
    }

    #[test]
    fn retired_buffers_return_on_next_store() {
        let mut table = PrefetchIndexTable::new(2, 0, 1).unwrap();
        table.store_state().unwrap();
        let free = table.free_count();
        let old = table.canonical_index(0);
        table.open_round();
        table.flip(0, 0).unwrap();
        table.accept(0).unwrap();
        // the checkpoint still reads `old`
        assert!(!table.pool.contains(old));
        assert_eq!(table.free_count(), free - 1);
        table.store_state().unwrap();
        assert!(table.pool.contains(old));
        assert_eq!(table.free_count(), free);
    }

    #[test]
    fn reset_lane_frees_its_flips() {
        let mut table = PrefetchIndexTable::new(3, 0, 2).unwrap();
        let free = table.free_count();
        table.open_round();
        table.flip(1, 0).unwrap();
        table.flip(1, 2).unwrap();
        table.reset_lane(1).unwrap();
        assert_eq!(table.free_count(), free);
        assert_eq!(mapping(&table, 1), canonical(&table));
        table.flip(1, 0).unwrap();
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Step {
        Flip(usize, usize),
        Accept(usize),
        RejectAll,
        Store,
        Restore,
    }

    fn step(lanes: usize, slots: usize) -> impl Strategy<Value = Step> {
        prop_oneof![
            6 => (0..lanes, 0..slots).prop_map(|(l, s)| Step::Flip(l, s)),
            2 => (0..lanes).prop_map(Step::Accept),
            2 => Just(Step::RejectAll),
            1 => Just(Step::Store),
            1 => Just(Step::Restore),
        ]
    }

    /// Every physical index is in exactly one place: the pool, a live
    /// mapping, the retired list, or the chain checkpoint.
    fn assert_conserved(table: &PrefetchIndexTable) {
        let mut live = std::collections::BTreeSet::new();
        for slot in table.min_index..table.slot_count() {
            live.insert(table.canonical[slot]);
            for lane in 0..table.lane_count() {
                live.insert(table.lanes[lane][slot]);
            }
            if let Some(cp) = &table.chain {
                live.insert(cp.mapping[slot]);
            }
        }
        live.extend(table.retired.iter().copied());
        for idx in live.iter() {
            assert!(!table.pool.contains(*idx), "index {} is live and free", idx);
        }
        let dynamic_total = table.physical_count() - table.min_index;
        assert_eq!(live.len() + table.free_count(), dynamic_total);
    }

    proptest! {
        #[test]
        fn isolation_and_conservation(
            lanes in 1usize..4,
            steps in proptest::collection::vec(step(3, 5), 1..60),
        ) {
            let mut table = PrefetchIndexTable::new(5, 1, lanes).unwrap();
            for st in steps {
                match st {
                    Step::Flip(l, s) => {
                        if l < lanes && s >= 1 {
                            table.open_round();
                            let _ = table.ensure_flipped(l, s).unwrap();
                            for other in 0..lanes {
                                if other != l {
                                    prop_assert_ne!(
                                        table.buffer_index(l, s),
                                        table.buffer_index(other, s)
                                    );
                                }
                            }
                        }
                    }
                    Step::Accept(l) => {
                        if l < lanes && table.status() == RoundStatus::Open {
                            let winner: Vec<usize> =
                                (0..5).map(|s| table.buffer_index(l, s)).collect();
                            table.accept(l).unwrap();
                            let canon: Vec<usize> =
                                (0..5).map(|s| table.canonical_index(s)).collect();
                            prop_assert_eq!(canon, winner);
                        }
                    }
                    Step::RejectAll => {
                        if table.status() != RoundStatus::Open {
                            continue;
                        }
                        table.reject_all().unwrap();
                    }
                    Step::Store => {
                        if table.status() != RoundStatus::Open {
                            table.store_state().unwrap();
                        }
                    }
                    Step::Restore => {
                        if table.status() != RoundStatus::Open && table.has_checkpoint() {
                            table.restore_state().unwrap();
                        }
                    }
                }
                assert_conserved(&table);
                for s in 0..5 {
                    for l in 0..lanes {
                        if !table.is_flipped(l, s) {
                            prop_assert_eq!(table.buffer_index(l, s), table.canonical_index(s));
                        }
                    }
                }
            }
        }
    }
}

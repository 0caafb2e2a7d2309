//! The prefetching likelihood engine.
//!
//! [`PrefetchLikelihood`] owns one traversal planner per lane, the process
//! delegate, and the partials buffers. A round looks like this:
//!
//! 1. [`start_prefetch_operation`](PrefetchLikelihood::start_prefetch_operation)
//!    on each lane, with the operator editing its own copy of the tree and
//!    reporting changed nodes through
//!    [`node_changed`](PrefetchLikelihood::node_changed);
//! 2. [`finish_prefetch_operation`](PrefetchLikelihood::finish_prefetch_operation)
//!    per lane, or [`prepare_prefetch`](PrefetchLikelihood::prepare_prefetch)
//!    per lane followed by one
//!    [`evaluate_prepared`](PrefetchLikelihood::evaluate_prepared);
//! 3. exactly one of [`accept_prefetch`](PrefetchLikelihood::accept_prefetch)
//!    or [`reject_all_prefetches`](PrefetchLikelihood::reject_all_prefetches).
//!
//! Chain-level [`store_state`](PrefetchLikelihood::store_state) and
//! [`restore_state`](PrefetchLikelihood::restore_state) sit between rounds.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use cyanea_core::{Checkpointed, CyaneaError, Result, Summarizable};
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferArena;
use crate::config::{PrefetchConfig, RescalingScheme};
use crate::models::{SiteRates, NUM_STATES};
use crate::partials::{integrate_root, update_partials, PartialsBuffer, PartialsLayout, RootOutcome};
use crate::patterns::SitePatterns;
use crate::prefetch_index::{PrefetchIndexTable, RoundStatus};
use crate::process::ProcessDelegate;
use crate::subst_model::{BranchProcess, SubstitutionProcess};
use crate::traversal::{DirtySet, TraversalPlan, TraversalPlanner};
use crate::tree::{NodeId, NodeSlots, PhyloTree, TreeSnapshot, TreeView};

/// Where a lane is in its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Idle,
    /// Started; collecting dirty marks.
    Dirty,
    /// Planned and holding private buffers for its work.
    Traversed,
    /// Holds a cached result.
    Evaluated,
}

/// Outcome of evaluating one lane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LaneResult {
    LogLikelihood(f64),
    /// The model produced NaN or infinity; treat the proposal as rejected.
    NonFinite,
}

impl LaneResult {
    pub fn log_likelihood(&self) -> Option<f64> {
        match self {
            Self::LogLikelihood(ll) => Some(*ll),
            Self::NonFinite => None,
        }
    }
}

/// Work done since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchCounters {
    pub node_operations: u64,
    pub matrix_updates: u64,
    pub likelihood_calculations: u64,
    pub cache_hits: u64,
    pub underflow_retries: u64,
    pub accepted_rounds: u64,
    pub rejected_rounds: u64,
}

#[derive(Debug)]
struct Lane {
    state: LaneState,
    planner: TraversalPlanner,
    snapshot: Option<TreeSnapshot>,
    plan: TraversalPlan,
    result: Option<LaneResult>,
}

impl Lane {
    fn clear(&mut self) {
        self.state = LaneState::Idle;
        self.planner.set_all_nodes_updated();
        self.plan = TraversalPlan::default();
        self.result = None;
    }
}

/// Multi-lane speculative tree likelihood with commit and rollback.
#[derive(Debug)]
pub struct PrefetchLikelihood {
    config: PrefetchConfig,
    slots: NodeSlots,
    layout: PartialsLayout,
    pattern_weights: Vec<f64>,
    proportions: Vec<f64>,
    process: ProcessDelegate,
    partials_table: PrefetchIndexTable,
    partials: BufferArena<PartialsBuffer>,
    lanes: Vec<Lane>,
    pending: DirtySet,
    current: Option<f64>,
    stored: Option<f64>,
    /// Tip buffers as they were at the last store, for taxa changed since.
    stored_tips: Vec<(usize, PartialsBuffer)>,
    rescaling_active: bool,
    ignore_tree_events: bool,
    active_lane: Option<usize>,
    counters: PrefetchCounters,
}

impl PrefetchLikelihood {
    /// Build an engine for `tree` and an alignment whose rows follow the
    /// tips' name order.
    ///
    /// # Errors
    ///
    /// Invalid configuration, a sequence count that does not match the tips,
    /// a tree whose root is a tip, or a non-nucleotide process.
    pub fn new(
        tree: &PhyloTree,
        patterns: &SitePatterns,
        process: BranchProcess,
        site_rates: SiteRates,
        config: PrefetchConfig,
    ) -> Result<Self> {
        config.validate()?;
        if tree.is_leaf(tree.root()) {
            return Err(CyaneaError::InvalidInput("the root must have children".into()));
        }
        let slots = NodeSlots::new(tree);
        if slots.tip_count() != patterns.taxon_count() {
            return Err(CyaneaError::InvalidInput(format!(
                "expected {} sequences for {} leaves, got {}",
                slots.tip_count(),
                slots.tip_count(),
                patterns.taxon_count()
            )));
        }
        if process.state_count() != NUM_STATES {
            return Err(CyaneaError::InvalidInput(format!(
                "alignment is nucleotide but the process has {} states",
                process.state_count()
            )));
        }

        let node_count = tree.node_count();
        let lane_count = config.lane_count;
        let layout = PartialsLayout {
            patterns: patterns.pattern_count(),
            categories: site_rates.len(),
            states: NUM_STATES,
        };
        let depth_dependent = process.depends_on_depth();
        let process = ProcessDelegate::new(process, &site_rates, node_count, lane_count)?;
        let partials_table = PrefetchIndexTable::new(slots.len(), slots.tip_count(), lane_count)?;
        let tip_count = slots.tip_count();
        let partials = BufferArena::from_fn(partials_table.physical_count(), |i| {
            if i < tip_count {
                PartialsBuffer::from_tip(&layout, &patterns.tip_partials(i))
            } else {
                PartialsBuffer::zeros(&layout)
            }
        });
        let lanes = (0..lane_count)
            .map(|_| Lane {
                state: LaneState::Idle,
                planner: TraversalPlanner::new(node_count).with_depth_propagation(depth_dependent),
                snapshot: None,
                plan: TraversalPlan::default(),
                result: None,
            })
            .collect();

        let mut engine = Self {
            slots,
            layout,
            pattern_weights: patterns.weights().to_vec(),
            proportions: site_rates.proportions().to_vec(),
            process,
            partials_table,
            partials,
            lanes,
            pending: DirtySet::all(node_count),
            current: None,
            stored: None,
            stored_tips: Vec::new(),
            rescaling_active: false,
            ignore_tree_events: false,
            active_lane: None,
            counters: PrefetchCounters::default(),
            config,
        };
        if engine.config.rescaling == RescalingScheme::Always {
            engine.activate_rescaling();
        }
        info!(
            lanes = lane_count,
            nodes = node_count,
            patterns = layout.patterns,
            categories = layout.categories,
            partials_buffers = engine.partials.len(),
            "prefetch likelihood ready"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Number of lanes not yet started this round.
    pub fn lanes_available(&self) -> usize {
        self.lanes.iter().filter(|l| l.state == LaneState::Idle).count()
    }

    pub fn lane_state(&self, lane: usize) -> Result<LaneState> {
        self.check_lane(lane)?;
        Ok(self.lanes[lane].state)
    }

    /// True once partials are being rescaled.
    pub fn is_rescaling(&self) -> bool {
        self.rescaling_active
    }

    /// Committed log-likelihood, if it is up to date.
    pub fn current_log_likelihood(&self) -> Option<f64> {
        self.current.filter(|_| self.pending.is_empty())
    }

    pub fn counters(&self) -> PrefetchCounters {
        PrefetchCounters {
            matrix_updates: self.process.matrix_update_count(),
            ..self.counters
        }
    }

    // ---- dirty marking -------------------------------------------------

    pub fn mark_dirty(&mut self, lane: usize, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        self.started_lane_mut(lane)?.planner.mark_node(node);
        Ok(())
    }

    pub fn mark_all_dirty(&mut self, lane: usize) -> Result<()> {
        self.started_lane_mut(lane)?.planner.mark_all();
        Ok(())
    }

    /// Mark `node` and its children dirty in `lane`.
    pub fn mark_node_and_children(&mut self, lane: usize, tree: &dyn TreeView, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        self.started_lane_mut(lane)?.planner.mark_node_and_children(tree, node);
        Ok(())
    }

    /// Mark the whole subtree below `node` dirty in `lane`.
    pub fn mark_node_and_descendants(&mut self, lane: usize, tree: &dyn TreeView, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        self.started_lane_mut(lane)?.planner.mark_node_and_descendants(tree, node);
        Ok(())
    }

    /// Tree notification: the branch above `node` (or its data) changed.
    ///
    /// Goes to the lane most recently started and not yet planned; with no
    /// such lane it invalidates the committed likelihood instead.
    pub fn node_changed(&mut self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        if self.ignore_tree_events {
            return Ok(());
        }
        match self.active_lane {
            Some(lane) => {
                let lane = &mut self.lanes[lane];
                lane.planner.mark_node(node);
                lane.state = LaneState::Dirty;
            }
            None => {
                self.pending.mark(node);
                self.current = None;
            }
        }
        Ok(())
    }

    /// Tree notification: topology or every branch changed.
    pub fn tree_changed(&mut self) {
        if self.ignore_tree_events {
            return;
        }
        match self.active_lane {
            Some(lane) => {
                let lane = &mut self.lanes[lane];
                lane.planner.mark_all();
                lane.state = LaneState::Dirty;
            }
            None => {
                self.pending.mark_all();
                self.current = None;
            }
        }
    }

    /// While set, tree notifications are dropped.
    ///
    /// Lets an operator put the shared tree back after a lane was planned.
    pub fn set_ignore_tree_events(&mut self, ignore: bool) {
        self.ignore_tree_events = ignore;
    }

    // ---- lane lifecycle ------------------------------------------------

    /// Open the round if needed and give `lane` a fresh start from the
    /// committed state.
    ///
    /// Restarting a lane within a round drops everything it did so far.
    pub fn start_prefetch_operation(&mut self, lane: usize) -> Result<()> {
        self.check_lane(lane)?;
        self.process.open_round();
        self.partials_table.open_round();
        if self.lanes[lane].state != LaneState::Idle {
            self.process.reset_lane(lane)?;
            self.partials_table.reset_lane(lane)?;
        }
        let entry = &mut self.lanes[lane];
        entry.planner.load(&self.pending);
        entry.plan = TraversalPlan::default();
        entry.result = None;
        entry.state = LaneState::Dirty;
        self.active_lane = Some(lane);
        debug!(lane, pending = self.pending.len(), "started prefetch lane");
        Ok(())
    }

    /// Freeze `tree` for `lane`, plan its work and give it private buffers.
    ///
    /// Runs on the control thread; a lane with a cached result and nothing
    /// dirty is left as it is.
    pub fn prepare_prefetch(&mut self, lane: usize, tree: &dyn TreeView) -> Result<()> {
        self.check_lane(lane)?;
        if tree.node_count() != self.slots.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "tree has {} nodes, engine was built for {}",
                tree.node_count(),
                self.slots.len()
            )));
        }
        if self.active_lane == Some(lane) {
            self.active_lane = None;
        }
        let entry = &mut self.lanes[lane];
        match entry.state {
            LaneState::Idle => {
                return Err(CyaneaError::invariant(format!("lane {} was not started", lane)))
            }
            LaneState::Evaluated if !entry.planner.has_updates() => return Ok(()),
            _ => {}
        }
        let refreshed = entry
            .snapshot
            .as_mut()
            .map_or(false, |snapshot| snapshot.refresh_lengths(tree));
        if !refreshed {
            entry.snapshot = Some(TreeSnapshot::capture(tree));
        }
        self.plan_lane(lane)
    }

    /// Evaluate every prepared lane, in parallel with the `parallel` feature.
    ///
    /// Underflow retries run afterwards on the calling thread.
    pub fn evaluate_prepared(&mut self) -> Result<Vec<(usize, LaneResult)>> {
        let ready: Vec<usize> = (0..self.lanes.len())
            .filter(|&l| self.lanes[l].state == LaneState::Traversed)
            .collect();

        #[cfg(feature = "parallel")]
        let outcomes: Vec<Result<RootOutcome>> =
            ready.par_iter().map(|&lane| self.evaluate_lane(lane)).collect();
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<Result<RootOutcome>> =
            ready.iter().map(|&lane| self.evaluate_lane(lane)).collect();

        let mut results = Vec::with_capacity(ready.len());
        for (lane, outcome) in ready.into_iter().zip(outcomes) {
            results.push((lane, self.settle(lane, outcome?)?));
        }
        Ok(results)
    }

    /// Plan, compute and cache the log-likelihood of `lane` on `tree`.
    ///
    /// Returns the cached result without any work when nothing was marked
    /// since the last evaluation.
    pub fn finish_prefetch_operation(&mut self, lane: usize, tree: &dyn TreeView) -> Result<LaneResult> {
        self.check_lane(lane)?;
        if let Some(result) = self.cached_result(lane) {
            if self.active_lane == Some(lane) {
                self.active_lane = None;
            }
            return Ok(result);
        }
        self.prepare_prefetch(lane, tree)?;
        let outcome = self.evaluate_lane(lane)?;
        self.settle(lane, outcome)
    }

    /// Result of `lane`, recomputing only if it is dirty.
    pub fn get_log_likelihood(&mut self, lane: usize, tree: &dyn TreeView) -> Result<LaneResult> {
        self.finish_prefetch_operation(lane, tree)
    }

    /// Committed log-likelihood of `tree`, evaluated through lane 0 and
    /// accepted when the cached value is stale.
    ///
    /// # Errors
    ///
    /// Calling this while a round is open is an invariant violation; a
    /// non-finite committed likelihood is a computation error.
    pub fn log_likelihood(&mut self, tree: &dyn TreeView) -> Result<f64> {
        if let Some(ll) = self.current_log_likelihood() {
            self.counters.cache_hits += 1;
            return Ok(ll);
        }
        if self.partials_table.status() == RoundStatus::Open {
            return Err(CyaneaError::invariant(
                "committed likelihood requested while a prefetch round is open",
            ));
        }
        self.start_prefetch_operation(0)?;
        match self.finish_prefetch_operation(0, tree)? {
            LaneResult::LogLikelihood(ll) => {
                self.accept_prefetch(0)?;
                Ok(ll)
            }
            LaneResult::NonFinite => {
                self.reject_all_prefetches()?;
                Err(CyaneaError::Computation(
                    "committed tree has a non-finite likelihood".into(),
                ))
            }
        }
    }

    /// Make `lane` the committed state and discard every other lane.
    ///
    /// # Errors
    ///
    /// No open round, a second accept in the same round, or a lane without
    /// a finite evaluated likelihood.
    pub fn accept_prefetch(&mut self, lane: usize) -> Result<()> {
        self.check_lane(lane)?;
        match self.partials_table.status() {
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
        let ll = match (self.lanes[lane].state, self.lanes[lane].result) {
            (LaneState::Evaluated, Some(LaneResult::LogLikelihood(ll))) => ll,
            _ => {
                return Err(CyaneaError::invariant(format!(
                    "lane {} has no finite evaluated likelihood",
                    lane
                )))
            }
        };
        self.process.accept(lane)?;
        self.partials_table.accept(lane)?;
        self.current = Some(ll);
        self.pending.clear();
        self.end_round();
        self.counters.accepted_rounds += 1;
        debug!(lane, log_likelihood = ll, "accepted prefetch lane");
        Ok(())
    }

    /// Throw away every lane's work for this round.
    ///
    /// Safe at any point after a lane was started; the committed state is
    /// left exactly as it was when the round opened.
    pub fn reject_all_prefetches(&mut self) -> Result<()> {
        let was_open = self.partials_table.status() == RoundStatus::Open;
        self.process.reject_all()?;
        self.partials_table.reject_all()?;
        self.end_round();
        if was_open {
            self.counters.rejected_rounds += 1;
            debug!("rejected all prefetch lanes");
        }
        Ok(())
    }

    /// Checkpoint the committed state for the chain.
    ///
    /// # Errors
    ///
    /// Storing mid-round or while the committed likelihood is unknown.
    pub fn store_state(&mut self) -> Result<()> {
        self.ensure_between_rounds("store")?;
        let ll = self.current_log_likelihood().ok_or_else(|| {
            CyaneaError::invariant("store while the committed likelihood is unknown")
        })?;
        self.process.store_state()?;
        self.partials_table.store_state()?;
        self.stored = Some(ll);
        self.stored_tips.clear();
        debug!(log_likelihood = ll, "stored chain state");
        Ok(())
    }

    /// Roll the committed state back to the last store.
    pub fn restore_state(&mut self) -> Result<()> {
        self.ensure_between_rounds("restore")?;
        if !self.partials_table.has_checkpoint() {
            return Err(CyaneaError::invariant("restore without a matching store"));
        }
        self.process.restore_state()?;
        self.partials_table.restore_state()?;
        for (taxon, tip) in std::mem::take(&mut self.stored_tips) {
            let buffer = self.partials.get_mut(taxon);
            *buffer = tip;
            if self.rescaling_active {
                buffer.normalize(&self.layout);
            }
        }
        self.current = self.stored.take();
        self.pending.clear();
        self.end_round();
        debug!(log_likelihood = ?self.current, "restored chain state");
        Ok(())
    }

    /// Swap in new substitution-process parameters between rounds.
    ///
    /// Every node becomes dirty; a later `restore_state` brings the old
    /// process and its eigen systems back.
    pub fn update_process(&mut self, process: BranchProcess) -> Result<()> {
        self.ensure_between_rounds("process update")?;
        self.process.set_process(process)?;
        self.pending.mark_all();
        self.current = None;
        Ok(())
    }

    /// Replace the tip partials of taxon `taxon` (tips in name order),
    /// given pattern-major as `pattern_count * 4` values.
    ///
    /// With a chain checkpoint held, the first change to a taxon saves its
    /// old buffer so `restore_state` puts it back.
    pub fn set_tip_partials(&mut self, taxon: usize, partials: &[f64]) -> Result<()> {
        self.ensure_between_rounds("tip update")?;
        if taxon >= self.slots.tip_count() {
            return Err(CyaneaError::InvalidInput(format!(
                "taxon {} out of range ({} tips)",
                taxon,
                self.slots.tip_count()
            )));
        }
        if partials.len() != self.layout.patterns * self.layout.states {
            return Err(CyaneaError::InvalidInput(format!(
                "expected {} tip values, got {}",
                self.layout.patterns * self.layout.states,
                partials.len()
            )));
        }
        // static slot: the physical index is the slot itself
        if self.partials_table.has_checkpoint() && self.stored_tips.iter().all(|(t, _)| *t != taxon) {
            let old = self.partials.get_mut(taxon).clone();
            self.stored_tips.push((taxon, old));
        }
        let buffer = self.partials.get_mut(taxon);
        buffer.set_tip(&self.layout, partials);
        if self.rescaling_active {
            buffer.normalize(&self.layout);
        }
        self.pending.mark(self.slots.node(taxon));
        self.current = None;
        Ok(())
    }

    /// Multi-line account of the work done so far.
    pub fn report(&self) -> String {
        let c = self.counters();
        let mut out = String::new();
        out.push_str(&format!(
            "PrefetchLikelihood: {} lanes, {} nodes, {} patterns, {} categories\n",
            self.lanes.len(),
            self.slots.len(),
            self.layout.patterns,
            self.layout.categories
        ));
        out.push_str(&format!("  likelihood calculations: {}\n", c.likelihood_calculations));
        out.push_str(&format!("  node operations:         {}\n", c.node_operations));
        out.push_str(&format!("  matrix updates:          {}\n", c.matrix_updates));
        out.push_str(&format!("  cache hits:              {}\n", c.cache_hits));
        out.push_str(&format!("  underflow retries:       {}\n", c.underflow_retries));
        out.push_str(&format!(
            "  rounds accepted/rejected: {}/{}\n",
            c.accepted_rounds, c.rejected_rounds
        ));
        out.push_str(&format!(
            "  rescaling: {:?} ({})",
            self.config.rescaling,
            if self.rescaling_active { "active" } else { "inactive" }
        ));
        out
    }

    // ---- internals -----------------------------------------------------

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

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node >= self.slots.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "node {} out of range ({})",
                node,
                self.slots.len()
            )));
        }
        Ok(())
    }

    fn started_lane_mut(&mut self, lane: usize) -> Result<&mut Lane> {
        self.check_lane(lane)?;
        let entry = &mut self.lanes[lane];
        if entry.state == LaneState::Idle {
            return Err(CyaneaError::invariant(format!("lane {} was not started", lane)));
        }
        entry.state = LaneState::Dirty;
        Ok(entry)
    }

    fn ensure_between_rounds(&self, what: &str) -> Result<()> {
        if self.partials_table.status() == RoundStatus::Open {
            return Err(CyaneaError::invariant(format!(
                "{} while a prefetch round is open",
                what
            )));
        }
        Ok(())
    }

    fn cached_result(&mut self, lane: usize) -> Option<LaneResult> {
        let entry = &self.lanes[lane];
        if entry.state == LaneState::Evaluated && !entry.planner.has_updates() {
            self.counters.cache_hits += 1;
            entry.result
        } else {
            None
        }
    }

    fn end_round(&mut self) {
        for lane in &mut self.lanes {
            lane.clear();
        }
        self.active_lane = None;
    }

    /// Plan from the lane's snapshot and flip every buffer the plan writes.
    fn plan_lane(&mut self, lane: usize) -> Result<()> {
        let plan = {
            let entry = &self.lanes[lane];
            let snapshot = entry
                .snapshot
                .as_ref()
                .ok_or_else(|| CyaneaError::invariant(format!("lane {} has no tree snapshot", lane)))?;
            entry.planner.plan(snapshot)
        };
        for op in &plan.branch_operations {
            self.process.prepare_matrix(lane, op.node)?;
        }
        for op in &plan.node_operations {
            self.partials_table.ensure_flipped(lane, self.slots.slot(op.node))?;
        }
        trace!(
            lane,
            branches = plan.branch_operations.len(),
            nodes = plan.node_operations.len(),
            "planned lane"
        );
        let entry = &mut self.lanes[lane];
        entry.plan = plan;
        entry.state = LaneState::Traversed;
        Ok(())
    }

    /// Run a planned lane's matrix and partials work and integrate the root.
    ///
    /// Only touches buffers the lane flipped, so lanes may run concurrently.
    fn evaluate_lane(&self, lane: usize) -> Result<RootOutcome> {
        let entry = &self.lanes[lane];
        let snapshot = entry
            .snapshot
            .as_ref()
            .ok_or_else(|| CyaneaError::invariant(format!("lane {} has no tree snapshot", lane)))?;

        for op in &entry.plan.branch_operations {
            let index = self.process.matrix_index(lane, op.node);
            if !self.process.compute_matrix(index, op.length, op.start_depth) {
                return Ok(RootOutcome::NonFinite);
            }
        }

        for op in &entry.plan.node_operations {
            let child_partials: Vec<_> = op
                .children
                .iter()
                .map(|&c| self.partials.read(self.partials_index(lane, c)))
                .collect();
            let child_matrices: Vec<_> = op
                .children
                .iter()
                .map(|&c| self.process.matrix(self.process.matrix_index(lane, c)))
                .collect();
            let children: Vec<(&PartialsBuffer, &[f64])> = child_partials
                .iter()
                .zip(&child_matrices)
                .map(|(p, m)| (&**p, m.as_slice()))
                .collect();
            let mut dest = self.partials.write(self.partials_index(lane, op.node));
            update_partials(&mut dest, &children, &self.layout, self.rescaling_active);
        }

        let root = self.partials.read(self.partials_index(lane, snapshot.root()));
        let threshold = match self.config.rescaling {
            RescalingScheme::Dynamic if !self.rescaling_active => Some(self.config.rescale_threshold),
            _ => None,
        };
        Ok(integrate_root(
            &root,
            &self.layout,
            self.process.root_frequencies(),
            &self.proportions,
            &self.pattern_weights,
            threshold,
        ))
    }

    fn partials_index(&self, lane: usize, node: NodeId) -> usize {
        self.partials_table.buffer_index(lane, self.slots.slot(node))
    }

    /// Turn a lane's root outcome into its cached result, retrying with
    /// rescaling on underflow.
    fn settle(&mut self, lane: usize, mut outcome: RootOutcome) -> Result<LaneResult> {
        let mut retries = 0;
        loop {
            self.counters.likelihood_calculations += 1;
            self.counters.node_operations += self.lanes[lane].plan.node_operations.len() as u64;
            match outcome {
                RootOutcome::LogLikelihood(ll) => {
                    return Ok(self.finish_lane(lane, LaneResult::LogLikelihood(ll)));
                }
                RootOutcome::NonFinite => {
                    warn!(lane, "non-finite likelihood, lane will be rejected");
                    return Ok(self.finish_lane(lane, LaneResult::NonFinite));
                }
                RootOutcome::Underflow => {
                    if retries >= self.config.max_underflow_retries {
                        return Err(CyaneaError::Computation(format!(
                            "lane {} still underflows after {} rescaling retries",
                            lane, retries
                        )));
                    }
                    retries += 1;
                    self.counters.underflow_retries += 1;
                    warn!(lane, retry = retries, "likelihood underflow, retrying with rescaling");
                    self.activate_rescaling();
                    self.lanes[lane].planner.mark_all();
                    self.plan_lane(lane)?;
                    outcome = self.evaluate_lane(lane)?;
                }
            }
        }
    }

    fn finish_lane(&mut self, lane: usize, result: LaneResult) -> LaneResult {
        let entry = &mut self.lanes[lane];
        entry.planner.set_all_nodes_updated();
        entry.result = Some(result);
        entry.state = LaneState::Evaluated;
        debug!(lane, ?result, "finished prefetch lane");
        result
    }

    fn activate_rescaling(&mut self) {
        if self.rescaling_active || self.config.rescaling == RescalingScheme::Never {
            return;
        }
        self.rescaling_active = true;
        for taxon in 0..self.slots.tip_count() {
            self.partials.get_mut(taxon).normalize(&self.layout);
        }
        info!(scheme = ?self.config.rescaling, "partials rescaling enabled");
    }
}

impl Summarizable for PrefetchLikelihood {
    fn summary(&self) -> String {
        let c = self.counters();
        format!(
            "PrefetchLikelihood: {} lanes, {} evaluations, {} cache hits",
            self.lanes.len(),
            c.likelihood_calculations,
            c.cache_hits
        )
    }
}

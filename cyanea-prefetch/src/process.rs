//! Evolutionary process delegate: eigen systems and per-branch transition matrices.
//!
//! Eigen decompositions are shared by every lane and versioned only at the
//! chain level, through a [`BufferIndexTable`]. Transition matrices are
//! versioned per lane through a [`PrefetchIndexTable`] whose slot is the
//! node below the branch.

use std::sync::atomic::{AtomicU64, Ordering};

use cyanea_core::{Checkpointed, CyaneaError, Result};
use parking_lot::RwLockReadGuard;
use tracing::{debug, trace};

use crate::buffer::BufferArena;
use crate::buffer_index::BufferIndexTable;
use crate::models::SiteRates;
use crate::prefetch_index::PrefetchIndexTable;
use crate::subst_model::{BranchProcess, EigenDecomposition, SubstitutionProcess};
use crate::traversal::BranchOperation;
use crate::tree::NodeId;

/// Owns the model-derived buffers the likelihood engine reads.
#[derive(Debug)]
pub struct ProcessDelegate {
    process: BranchProcess,
    stored_process: Option<BranchProcess>,
    category_rates: Vec<f64>,
    state_count: usize,
    eigen_table: BufferIndexTable,
    eigen_buffers: Vec<EigenDecomposition>,
    matrix_table: PrefetchIndexTable,
    matrices: BufferArena<Vec<f64>>,
    matrix_updates: AtomicU64,
}

impl ProcessDelegate {
    /// Decompose every model class and allocate matrix buffers for
    /// `node_count` branches and `lane_count` lanes.
    pub fn new(
        process: BranchProcess,
        site_rates: &SiteRates,
        node_count: usize,
        lane_count: usize,
    ) -> Result<Self> {
        let classes = process.class_count();
        let eigen_table = BufferIndexTable::new(classes, 0)?;
        let decomposed = decompose_all(&process)?;
        let eigen_buffers = (0..eigen_table.physical_count())
            .map(|i| decomposed[i % classes].clone())
            .collect();

        let matrix_table = PrefetchIndexTable::new(node_count, 0, lane_count)?;
        let state_count = process.state_count();
        let block = site_rates.len() * state_count * state_count;
        let matrices = BufferArena::from_fn(matrix_table.physical_count(), |_| vec![0.0; block]);

        debug!(
            classes,
            matrix_buffers = matrices.len(),
            categories = site_rates.len(),
            "allocated process buffers"
        );
        Ok(Self {
            process,
            stored_process: None,
            category_rates: site_rates.rates().to_vec(),
            state_count,
            eigen_table,
            eigen_buffers,
            matrix_table,
            matrices,
            matrix_updates: AtomicU64::new(0),
        })
    }

    pub fn process(&self) -> &BranchProcess {
        &self.process
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn root_frequencies(&self) -> &[f64] {
        self.process.root_frequencies()
    }

    /// True if a branch's matrix depends on its distance from the root.
    pub fn depends_on_depth(&self) -> bool {
        self.process.depends_on_depth()
    }

    pub fn matrix_table(&self) -> &PrefetchIndexTable {
        &self.matrix_table
    }

    /// Total matrices computed since construction.
    pub fn matrix_update_count(&self) -> u64 {
        self.matrix_updates.load(Ordering::Relaxed)
    }

    /// Eigen system currently serving model class `class`.
    pub fn eigen(&self, class: usize) -> &EigenDecomposition {
        &self.eigen_buffers[self.eigen_table.buffer_index(class)]
    }

    /// Replace the process parameters between rounds.
    ///
    /// Each class's eigen slot is flipped, so a chain restore brings the
    /// previous decomposition back without recomputing it.
    ///
    /// # Errors
    ///
    /// The new process must have the same shape; a decomposition that fails
    /// or is not finite is reported as a computation error and leaves the
    /// current process in place.
    pub fn set_process(&mut self, process: BranchProcess) -> Result<()> {
        if !self.process.same_shape(&process) {
            return Err(CyaneaError::InvalidInput(
                "replacement process must keep the variant, class and state counts".into(),
            ));
        }
        let decomposed = decompose_all(&process)?;
        for (class, eigen) in decomposed.into_iter().enumerate() {
            let index = self.eigen_table.ensure_flipped(class)?;
            self.eigen_buffers[index] = eigen;
        }
        self.process = process;
        debug!("substitution process updated");
        Ok(())
    }

    pub fn open_round(&mut self) {
        self.matrix_table.open_round();
    }

    pub fn accept(&mut self, lane: usize) -> Result<()> {
        self.matrix_table.accept(lane)
    }

    pub fn reject_all(&mut self) -> Result<()> {
        self.matrix_table.reject_all()
    }

    pub fn reset_lane(&mut self, lane: usize) -> Result<()> {
        self.matrix_table.reset_lane(lane)
    }

    /// Give `lane` a private matrix buffer for the branch above `node`.
    pub fn prepare_matrix(&mut self, lane: usize, node: NodeId) -> Result<usize> {
        self.matrix_table.ensure_flipped(lane, node)
    }

    /// Physical buffer lane `lane` reads for the branch above `node`.
    pub fn matrix_index(&self, lane: usize, node: NodeId) -> usize {
        self.matrix_table.buffer_index(lane, node)
    }

    pub fn matrix(&self, index: usize) -> RwLockReadGuard<'_, Vec<f64>> {
        self.matrices.read(index)
    }

    /// Flip and recompute the matrices of every branch in `operations`.
    ///
    /// Returns false if any matrix came out non-finite.
    pub fn update_transition_matrices(
        &mut self,
        lane: usize,
        operations: &[BranchOperation],
    ) -> Result<bool> {
        for op in operations {
            self.prepare_matrix(lane, op.node)?;
        }
        Ok(operations.iter().all(|op| {
            let index = self.matrix_index(lane, op.node);
            self.compute_matrix(index, op.length, op.start_depth)
        }))
    }

    /// Write the transition matrices for a branch into buffer `index`,
    /// one `n x n` block per rate category.
    ///
    /// Returns false if the result contains a non-finite entry.
    pub fn compute_matrix(&self, index: usize, length: f64, start_depth: f64) -> bool {
        let n = self.state_count;
        let mapping = self.process.branch_mapping(start_depth, length);
        let mut out = self.matrices.write(index);
        let mut segment = vec![0.0; n * n];
        let mut product = vec![0.0; n * n];

        for (c, &rate) in self.category_rates.iter().enumerate() {
            let block = &mut out[c * n * n..(c + 1) * n * n];
            let t = length * rate;
            let mut parts = mapping.order.iter().zip(&mapping.weights);
            if let Some((&class, &weight)) = parts.next() {
                self.eigen(class).transition_matrix_into(t * weight, block);
            }
            for (&class, &weight) in parts {
                self.eigen(class).transition_matrix_into(t * weight, &mut segment);
                multiply_into(block, &segment, &mut product, n);
                block.copy_from_slice(&product);
            }
        }
        self.matrix_updates.fetch_add(1, Ordering::Relaxed);
        let finite = out.iter().all(|v| v.is_finite());
        trace!(index, length, finite, "computed transition matrix");
        finite
    }
}

impl Checkpointed for ProcessDelegate {
    fn store_state(&mut self) -> Result<()> {
        self.matrix_table.store_state()?;
        self.eigen_table.store_state()?;
        self.stored_process = Some(self.process.clone());
        Ok(())
    }

    fn restore_state(&mut self) -> Result<()> {
        self.matrix_table.restore_state()?;
        self.eigen_table.restore_state()?;
        if let Some(process) = self.stored_process.take() {
            self.process = process;
        }
        Ok(())
    }

    fn has_checkpoint(&self) -> bool {
        self.matrix_table.has_checkpoint()
    }
}

fn decompose_all(process: &BranchProcess) -> Result<Vec<EigenDecomposition>> {
    (0..process.class_count())
        .map(|class| {
            let eigen = process.eigen_decomposition(class)?;
            if !eigen.is_finite() {
                return Err(CyaneaError::Computation(format!(
                    "eigen decomposition of class {} is not finite",
                    class
                )));
            }
            Ok(eigen)
        })
        .collect()
}

/// `out = a * b` for row-major `n x n` matrices.
fn multiply_into(a: &[f64], b: &[f64], out: &mut [f64], n: usize) {
    for i in 0..n {
        for j in 0..n {
            out[i * n + j] = (0..n).map(|k| a[i * n + k] * b[k * n + j]).sum();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::jc69_probability;
    use crate::subst_model::ReversibleModel;

    fn jc_delegate(lanes: usize) -> ProcessDelegate {
        ProcessDelegate::new(
            BranchProcess::homogeneous(ReversibleModel::jc69()),
            &SiteRates::uniform(),
            4,
            lanes,
        )
        .unwrap()
    }

    fn op(node: NodeId, length: f64) -> BranchOperation {
        BranchOperation {
            node,
            length,
            start_depth: 0.0,
        }
    }

    #[test]
    fn update_writes_only_the_lane_buffer() {
        let mut delegate = jc_delegate(2);
        delegate.open_round();
        let shared = delegate.matrix_index(1, 2);
        let before = delegate.matrix(shared).clone();
        assert!(delegate.update_transition_matrices(0, &[op(2, 0.3)]).unwrap());
        let own = delegate.matrix_index(0, 2);
        assert_ne!(own, shared);
        assert_eq!(*delegate.matrix(shared), before);
        let expected: Vec<f64> = jc69_probability(0.3).iter().flatten().copied().collect();
        for (x, y) in delegate.matrix(own).iter().zip(&expected) {
            assert!((x - y).abs() < 1e-12);
        }
        assert_eq!(delegate.matrix_update_count(), 1);
    }

    #[test]
    fn recomputing_in_the_same_round_reuses_the_flip() {
        let mut delegate = jc_delegate(1);
        delegate.open_round();
        delegate.update_transition_matrices(0, &[op(1, 0.1)]).unwrap();
        let first = delegate.matrix_index(0, 1);
        delegate.update_transition_matrices(0, &[op(1, 0.2)]).unwrap();
        assert_eq!(delegate.matrix_index(0, 1), first);
    }

    #[test]
    fn category_blocks_scale_branch_length() {
        let rates = SiteRates::equal_weights(vec![0.5, 2.0]).unwrap();
        let mut delegate = ProcessDelegate::new(
            BranchProcess::homogeneous(ReversibleModel::jc69()),
            &rates,
            3,
            1,
        )
        .unwrap();
        delegate.open_round();
        delegate.update_transition_matrices(0, &[op(1, 0.2)]).unwrap();
        let m = delegate.matrix(delegate.matrix_index(0, 1)).clone();
        assert!((m[1] - jc69_probability(0.1)[0][1]).abs() < 1e-12);
        assert!((m[16 + 1] - jc69_probability(0.4)[0][1]).abs() < 1e-12);
    }

    #[test]
    fn product_chain_of_identical_models_matches_single_model() {
        let process = BranchProcess::product_chain(
            vec![ReversibleModel::jc69(), ReversibleModel::jc69()],
            vec![1.0, 1.0],
        )
        .unwrap();
        let mut delegate = ProcessDelegate::new(process, &SiteRates::uniform(), 3, 1).unwrap();
        delegate.open_round();
        delegate.update_transition_matrices(0, &[op(1, 0.7)]).unwrap();
        let expected: Vec<f64> = jc69_probability(0.7).iter().flatten().copied().collect();
        for (x, y) in delegate.matrix(delegate.matrix_index(0, 1)).iter().zip(&expected) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn non_finite_length_is_reported() {
        let mut delegate = jc_delegate(1);
        delegate.open_round();
        assert!(!delegate.update_transition_matrices(0, &[op(1, f64::NAN)]).unwrap());
    }

    #[test]
    fn process_change_rolls_back_with_the_chain() {
        let mut delegate = jc_delegate(1);
        delegate.store_state().unwrap();
        let jc = delegate.eigen(0).clone();
        delegate
            .set_process(BranchProcess::homogeneous(ReversibleModel::k80(5.0).unwrap()))
            .unwrap();
        assert_ne!(delegate.eigen(0), &jc);
        delegate.restore_state().unwrap();
        assert_eq!(delegate.eigen(0), &jc);
        assert_eq!(
            delegate.process(),
            &BranchProcess::homogeneous(ReversibleModel::jc69())
        );
    }

    #[test]
    fn process_change_must_keep_shape() {
        let mut delegate = jc_delegate(1);
        let chain = BranchProcess::product_chain(vec![ReversibleModel::jc69()], vec![1.0]).unwrap();
        assert!(delegate.set_process(chain).is_err());
    }
}

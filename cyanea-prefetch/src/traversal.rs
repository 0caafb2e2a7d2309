//! Dirty tracking and the post-order operation planner.
//!
//! A [`TraversalPlanner`] remembers which nodes have stale cached values for
//! one lane and turns them into the smallest ordered list of matrix updates
//! and partial-likelihood accumulations that brings that lane up to date.

use crate::tree::{NodeId, TreeView};

/// Set of nodes whose cached branch matrix or partials are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtySet {
    flags: Vec<bool>,
    count: usize,
}

impl DirtySet {
    /// All `node_count` nodes clean.
    pub fn clean(node_count: usize) -> Self {
        Self {
            flags: vec![false; node_count],
            count: 0,
        }
    }

    /// All `node_count` nodes dirty.
    pub fn all(node_count: usize) -> Self {
        Self {
            flags: vec![true; node_count],
            count: node_count,
        }
    }

    pub fn mark(&mut self, node: NodeId) {
        if !self.flags[node] {
            self.flags[node] = true;
            self.count += 1;
        }
    }

    pub fn mark_all(&mut self) {
        self.flags.iter_mut().for_each(|f| *f = true);
        self.count = self.flags.len();
    }

    pub fn clear(&mut self) {
        self.flags.iter_mut().for_each(|f| *f = false);
        self.count = 0;
    }

    /// Add every node dirty in `other`.
    pub fn union_with(&mut self, other: &DirtySet) {
        for (node, &dirty) in other.flags.iter().enumerate() {
            if dirty {
                self.mark(node);
            }
        }
    }

    pub fn is_dirty(&self, node: NodeId) -> bool {
        self.flags[node]
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of dirty nodes.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn node_count(&self) -> usize {
        self.flags.len()
    }
}

/// Recompute the transition matrix on the branch above `node`.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchOperation {
    pub node: NodeId,
    pub length: f64,
    /// Distance from the root to the upper end of the branch.
    pub start_depth: f64,
}

/// Recompute the partials of `node` from its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOperation {
    pub node: NodeId,
    pub children: Vec<NodeId>,
}

/// Ordered work for one lane: all branch operations, then node operations
/// in children-before-parent order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraversalPlan {
    pub branch_operations: Vec<BranchOperation>,
    pub node_operations: Vec<NodeOperation>,
}

impl TraversalPlan {
    pub fn is_empty(&self) -> bool {
        self.branch_operations.is_empty() && self.node_operations.is_empty()
    }
}

/// Per-lane dirty state plus the planning walk.
#[derive(Debug, Clone)]
pub struct TraversalPlanner {
    dirty: DirtySet,
    propagate_depth: bool,
}

impl TraversalPlanner {
    /// A planner with every node dirty, so the first plan computes everything.
    pub fn new(node_count: usize) -> Self {
        Self {
            dirty: DirtySet::all(node_count),
            propagate_depth: false,
        }
    }

    /// Treat a changed branch as moving every branch below it.
    ///
    /// Needed when matrices depend on distance from the root.
    pub fn with_depth_propagation(mut self, on: bool) -> Self {
        self.propagate_depth = on;
        self
    }

    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// True if a plan would contain any work.
    pub fn has_updates(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn mark_node(&mut self, node: NodeId) {
        self.dirty.mark(node);
    }

    pub fn mark_node_and_children(&mut self, tree: &dyn TreeView, node: NodeId) {
        self.dirty.mark(node);
        for &child in tree.children(node) {
            self.dirty.mark(child);
        }
    }

    pub fn mark_node_and_descendants(&mut self, tree: &dyn TreeView, node: NodeId) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            self.dirty.mark(id);
            stack.extend_from_slice(tree.children(id));
        }
    }

    pub fn mark_all(&mut self) {
        self.dirty.mark_all();
    }

    /// Replace this planner's dirty set with a copy of `pending`.
    pub fn load(&mut self, pending: &DirtySet) {
        self.dirty.clone_from(pending);
    }

    /// Forget every dirty mark after a successful evaluation.
    pub fn set_all_nodes_updated(&mut self) {
        self.dirty.clear();
    }

    /// Walk `tree` once in post-order and emit the work for the dirty nodes.
    ///
    /// A dirty non-root node yields a branch operation, as does every branch
    /// below a dirty branch when depth propagation is on. A node yields a
    /// node operation if it is internal and either stale itself or above a
    /// stale node.
    pub fn plan(&self, tree: &dyn TreeView) -> TraversalPlan {
        let mut plan = TraversalPlan::default();
        if self.dirty.is_empty() {
            return plan;
        }

        let n = tree.node_count();
        let order = tree.postorder();
        let mut depth = vec![0.0; n];
        let mut stale = vec![false; n];
        for &node in order.iter().rev() {
            stale[node] = self.dirty.is_dirty(node);
            if let Some(parent) = tree.parent(node) {
                depth[node] = depth[parent] + tree.branch_length(node);
                if self.propagate_depth && stale[parent] && !tree.is_root(parent) {
                    stale[node] = true;
                }
            }
        }

        let mut affected = vec![false; n];
        for &node in &order {
            let children = tree.children(node);
            affected[node] = stale[node] || children.iter().any(|&c| affected[c]);
            if !affected[node] {
                continue;
            }
            if let (true, Some(parent)) = (stale[node], tree.parent(node)) {
                plan.branch_operations.push(BranchOperation {
                    node,
                    length: tree.branch_length(node),
                    start_depth: depth[parent],
                });
            }
            if !children.is_empty() {
                plan.node_operations.push(NodeOperation {
                    node,
                    children: children.to_vec(),
                });
            }
        }
        plan
    }
}

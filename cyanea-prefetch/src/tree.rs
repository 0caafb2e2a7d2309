//! Phylogenetic tree storage and the read-only view the likelihood engine consumes.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). The engine never touches
//! [`PhyloTree`] directly; it reads through [`TreeView`], and each prefetch
//! lane freezes its own [`TreeSnapshot`] when it is planned.

use cyanea_core::{CyaneaError, Result, Summarizable};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// Length used for a branch that carries no length at all.
pub const MISSING_BRANCH_LENGTH: f64 = 1e-6;

/// Read-only queries the likelihood engine needs from a tree.
pub trait TreeView {
    /// Total number of nodes, tips included.
    fn node_count(&self) -> usize;

    /// The root node id.
    fn root(&self) -> NodeId;

    /// Parent of `node` (None for the root).
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// Children of `node` (empty for tips).
    fn children(&self, node: NodeId) -> &[NodeId];

    /// Length of the branch above `node`.
    fn branch_length(&self, node: NodeId) -> f64;

    fn is_root(&self, node: NodeId) -> bool {
        self.parent(node).is_none()
    }

    fn is_leaf(&self, node: NodeId) -> bool {
        self.children(node).is_empty()
    }

    /// Children-before-parent ordering of every node.
    fn postorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.node_count());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend_from_slice(self.children(id));
        }
        order.reverse();
        order
    }
}

/// A single node in a phylogenetic tree.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes.
    pub children: Vec<NodeId>,
    /// Branch length from this node to its parent.
    pub branch_length: Option<f64>,
    /// Taxon or clade label.
    pub name: Option<String>,
}

impl Node {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A rooted phylogenetic tree stored as an arena of nodes.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhyloTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl PhyloTree {
    /// Create a new tree with a single unnamed root node.
    pub fn new() -> Self {
        let root = Node {
            id: 0,
            parent: None,
            children: Vec::new(),
            branch_length: None,
            name: None,
        };
        Self {
            nodes: vec![root],
            root: 0,
        }
    }

    /// Add a child to `parent` and return its `NodeId`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<String>,
        branch_length: Option<f64>,
    ) -> Result<NodeId> {
        self.check_node(parent)?;
        if let Some(len) = branch_length {
            check_length(len)?;
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            children: Vec::new(),
            branch_length,
            name,
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Build a tree whose root has one named tip child per `(name, length)` pair.
    pub fn star(tips: &[(&str, f64)]) -> Result<Self> {
        if tips.len() < 2 {
            return Err(CyaneaError::InvalidInput(
                "a star tree needs at least two tips".into(),
            ));
        }
        let mut tree = Self::new();
        for &(name, len) in tips {
            tree.add_child(0, Some(name.to_string()), Some(len))?;
        }
        Ok(tree)
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// All leaf node ids.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// Leaf ids ordered by name; unnamed leaves follow in id order.
    ///
    /// This is the order in which sequences are matched to tips.
    pub fn leaves_by_name(&self) -> Vec<NodeId> {
        let mut leaves = self.leaves();
        leaves.sort_by(|&a, &b| {
            let key = |id: NodeId| (self.nodes[id].name.is_none(), self.nodes[id].name.clone());
            key(a).cmp(&key(b)).then(a.cmp(&b))
        });
        leaves
    }

    /// Change the length of the branch above `node`.
    pub fn set_branch_length(&mut self, node: NodeId, length: f64) -> Result<()> {
        self.check_node(node)?;
        if node == self.root {
            return Err(CyaneaError::InvalidInput(
                "the root has no branch to set".into(),
            ));
        }
        check_length(length)?;
        self.nodes[node].branch_length = Some(length);
        Ok(())
    }

    /// Exchange the subtrees rooted at `a` and `b`, keeping each branch length
    /// with its subtree.
    ///
    /// Neither node may be the root, and neither may be an ancestor of the
    /// other. This is the move used by nearest-neighbour interchange.
    pub fn swap_subtrees(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        self.check_node(a)?;
        self.check_node(b)?;
        if a == b {
            return Ok(());
        }
        if self.is_ancestor(a, b) || self.is_ancestor(b, a) {
            return Err(CyaneaError::InvalidInput(format!(
                "nodes {} and {} are on one lineage",
                a, b
            )));
        }
        let (pa, pb) = match (self.nodes[a].parent, self.nodes[b].parent) {
            (Some(pa), Some(pb)) => (pa, pb),
            _ => {
                return Err(CyaneaError::InvalidInput(
                    "cannot swap the root".into(),
                ))
            }
        };
        if pa == pb {
            let kids = &mut self.nodes[pa].children;
            if let (Some(ia), Some(ib)) = (
                kids.iter().position(|&c| c == a),
                kids.iter().position(|&c| c == b),
            ) {
                kids.swap(ia, ib);
            }
            return Ok(());
        }
        for child in self.nodes[pa].children.iter_mut() {
            if *child == a {
                *child = b;
            }
        }
        for child in self.nodes[pb].children.iter_mut() {
            if *child == b {
                *child = a;
            }
        }
        self.nodes[a].parent = Some(pb);
        self.nodes[b].parent = Some(pa);
        Ok(())
    }

    /// True if `ancestor` lies on the path from `node` to the root.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = self.nodes.get(node).and_then(|n| n.parent);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.nodes[p].parent;
        }
        false
    }

    fn check_node(&self, id: NodeId) -> Result<()> {
        if id >= self.nodes.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "node index {} out of range ({})",
                id,
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

fn check_length(length: f64) -> Result<()> {
    if !length.is_finite() || length < 0.0 {
        return Err(CyaneaError::InvalidInput(format!(
            "branch length must be finite and non-negative, got {}",
            length
        )));
    }
    Ok(())
}

impl Default for PhyloTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeView for PhyloTree {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn root(&self) -> NodeId {
        self.root
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }

    fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].children
    }

    fn branch_length(&self, node: NodeId) -> f64 {
        self.nodes[node]
            .branch_length
            .unwrap_or(MISSING_BRANCH_LENGTH)
    }
}

impl Summarizable for PhyloTree {
    fn summary(&self) -> String {
        let leaves = self.leaf_count();
        format!(
            "PhyloTree: {} nodes ({} leaves, {} internal)",
            self.nodes.len(),
            leaves,
            self.nodes.len() - leaves
        )
    }
}

/// A frozen copy of a tree's shape and branch lengths.
///
/// A lane captures one of these when it is planned, so the operator is free
/// to revert the shared tree before the lane is evaluated or retried.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSnapshot {
    root: NodeId,
    parents: Vec<Option<NodeId>>,
    children: Vec<Vec<NodeId>>,
    lengths: Vec<f64>,
}

impl TreeSnapshot {
    /// Copy everything the engine reads from `tree`.
    pub fn capture(tree: &dyn TreeView) -> Self {
        let n = tree.node_count();
        Self {
            root: tree.root(),
            parents: (0..n).map(|i| tree.parent(i)).collect(),
            children: (0..n).map(|i| tree.children(i).to_vec()).collect(),
            lengths: (0..n).map(|i| tree.branch_length(i)).collect(),
        }
    }

    /// Re-copy only the branch lengths, reusing the existing allocation.
    ///
    /// Returns false (and copies nothing) if the shape differs.
    pub fn refresh_lengths(&mut self, tree: &dyn TreeView) -> bool {
        if tree.node_count() != self.lengths.len() || tree.root() != self.root {
            return false;
        }
        let same_shape = (0..self.lengths.len()).all(|i| {
            tree.parent(i) == self.parents[i] && tree.children(i) == self.children[i].as_slice()
        });
        if !same_shape {
            return false;
        }
        for (i, len) in self.lengths.iter_mut().enumerate() {
            *len = tree.branch_length(i);
        }
        true
    }
}

impl TreeView for TreeSnapshot {
    fn node_count(&self) -> usize {
        self.parents.len()
    }

    fn root(&self) -> NodeId {
        self.root
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parents[node]
    }

    fn children(&self, node: NodeId) -> &[NodeId] {
        &self.children[node]
    }

    fn branch_length(&self, node: NodeId) -> f64 {
        self.lengths[node]
    }
}

/// Numbering of nodes into logical buffer slots with tips first.
///
/// Tip slots come before `tip_count()` so they can be static slots of an
/// index table: tip data never changes during a run.
#[derive(Debug, Clone)]
pub struct NodeSlots {
    slot_of: Vec<usize>,
    node_of: Vec<NodeId>,
    tip_count: usize,
}

impl NodeSlots {
    /// Tips in name order, then internal nodes in id order.
    pub fn new(tree: &PhyloTree) -> Self {
        let tips = tree.leaves_by_name();
        let tip_count = tips.len();
        let mut node_of = tips;
        node_of.extend((0..tree.node_count()).filter(|&id| !tree.nodes[id].is_leaf()));
        let mut slot_of = vec![0; node_of.len()];
        for (slot, &node) in node_of.iter().enumerate() {
            slot_of[node] = slot;
        }
        Self {
            slot_of,
            node_of,
            tip_count,
        }
    }

    /// Logical slot of `node`.
    pub fn slot(&self, node: NodeId) -> usize {
        self.slot_of[node]
    }

    /// Node occupying logical slot `slot`.
    pub fn node(&self, slot: usize) -> NodeId {
        self.node_of[slot]
    }

    /// Number of tip slots (also the first internal slot).
    pub fn tip_count(&self) -> usize {
        self.tip_count
    }

    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.node_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_of.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> PhyloTree {
        // ((A:0.1,B:0.2)AB:0.3,(C:0.4,D:0.5)CD:0.6)root;
        let mut tree = PhyloTree::new();
        let ab = tree.add_child(0, Some("AB".into()), Some(0.3)).unwrap();
        let cd = tree.add_child(0, Some("CD".into()), Some(0.6)).unwrap();
        tree.add_child(ab, Some("A".into()), Some(0.1)).unwrap();
        tree.add_child(ab, Some("B".into()), Some(0.2)).unwrap();
        tree.add_child(cd, Some("C".into()), Some(0.4)).unwrap();
        tree.add_child(cd, Some("D".into()), Some(0.5)).unwrap();
        tree
    }

    #[test]
    fn add_child_rejects_bad_parent_and_length() {
        let mut tree = PhyloTree::new();
        assert!(tree.add_child(99, None, None).is_err());
        assert!(tree.add_child(0, None, Some(-1.0)).is_err());
        assert!(tree.add_child(0, None, Some(f64::NAN)).is_err());
    }

    #[test]
    fn postorder_visits_children_first() {
        let tree = sample_tree();
        // A(3), B(4), AB(1), C(5), D(6), CD(2), root(0)
        assert_eq!(tree.postorder(), vec![3, 4, 1, 5, 6, 2, 0]);
    }

    #[test]
    fn missing_length_reads_as_tiny_branch() {
        let mut tree = PhyloTree::new();
        let a = tree.add_child(0, Some("A".into()), None).unwrap();
        assert_eq!(tree.branch_length(a), MISSING_BRANCH_LENGTH);
    }

    #[test]
    fn set_branch_length_validates() {
        let mut tree = sample_tree();
        tree.set_branch_length(3, 0.9).unwrap();
        assert_eq!(tree.branch_length(3), 0.9);
        assert!(tree.set_branch_length(0, 0.1).is_err());
        assert!(tree.set_branch_length(3, f64::INFINITY).is_err());
    }

    #[test]
    fn swap_subtrees_exchanges_parents() {
        let mut tree = sample_tree();
        // swap B(4) with C(5)
        tree.swap_subtrees(4, 5).unwrap();
        assert_eq!(tree.parent(4), Some(2));
        assert_eq!(tree.parent(5), Some(1));
        assert_eq!(tree.children(1), &[3, 5]);
        assert_eq!(tree.children(2), &[4, 6]);
        assert_eq!(tree.branch_length(4), 0.2);
    }

    #[test]
    fn swap_subtrees_rejects_lineage() {
        let mut tree = sample_tree();
        assert!(tree.swap_subtrees(1, 3).is_err());
        assert!(tree.swap_subtrees(0, 3).is_err());
    }

    #[test]
    fn snapshot_is_independent_of_later_edits() {
        let mut tree = sample_tree();
        let snap = TreeSnapshot::capture(&tree);
        tree.set_branch_length(3, 2.0).unwrap();
        assert_eq!(snap.branch_length(3), 0.1);
        assert_eq!(snap.postorder(), tree.postorder());
    }

    #[test]
    fn snapshot_refresh_detects_shape_change() {
        let mut tree = sample_tree();
        let mut snap = TreeSnapshot::capture(&tree);
        tree.set_branch_length(6, 0.05).unwrap();
        assert!(snap.refresh_lengths(&tree));
        assert_eq!(snap.branch_length(6), 0.05);
        tree.swap_subtrees(4, 5).unwrap();
        assert!(!snap.refresh_lengths(&tree));
    }

    #[test]
    fn node_slots_put_named_tips_first() {
        let tree = sample_tree();
        let slots = NodeSlots::new(&tree);
        assert_eq!(slots.tip_count(), 4);
        assert_eq!(slots.len(), 7);
        // A, B, C, D by name
        assert_eq!(slots.node(0), 3);
        assert_eq!(slots.node(3), 6);
        for id in 0..7 {
            assert_eq!(slots.node(slots.slot(id)), id);
        }
        assert!(slots.slot(0) >= slots.tip_count());
    }

    #[test]
    fn summary_format() {
        let tree = sample_tree();
        assert_eq!(tree.summary(), "PhyloTree: 7 nodes (4 leaves, 3 internal)");
    }
}

//! Speculative likelihood prefetching for the Cyanea bioinformatics ecosystem.
//!
//! Lets one MCMC chain evaluate several candidate trees at once and commit
//! at most one of them per round:
//!
//! - **Versioned buffers**: chain-level and per-lane index tables over a
//!   shared free pool, so lanes never see each other's writes
//! - **Incremental pruning**: dirty tracking and post-order planning that
//!   recompute only what a move invalidated
//! - **Branch processes**: homogeneous, epoch and product-chain
//!   substitution processes over reversible nucleotide models
//! - **Rescaling**: unscaled evaluation with automatic retry under
//!   rescaling on underflow
//!
//! ```
//! use cyanea_prefetch::{
//!     BranchProcess, PhyloTree, PrefetchConfig, PrefetchLikelihood, ReversibleModel, SitePatterns,
//!     SiteRates,
//! };
//!
//! let tree = PhyloTree::star(&[("A", 0.1), ("B", 0.2), ("C", 0.3)]).unwrap();
//! let seqs: Vec<&[u8]> = vec![b"ACGT", b"ACGA", b"TCGA"];
//! let patterns = SitePatterns::from_sequences(&seqs).unwrap();
//! let mut engine = PrefetchLikelihood::new(
//!     &tree,
//!     &patterns,
//!     BranchProcess::homogeneous(ReversibleModel::jc69()),
//!     SiteRates::uniform(),
//!     PrefetchConfig::default(),
//! )
//! .unwrap();
//! let before = engine.log_likelihood(&tree).unwrap();
//!
//! let mut proposal = tree.clone();
//! proposal.set_branch_length(1, 0.5).unwrap();
//! engine.start_prefetch_operation(0).unwrap();
//! engine.node_changed(1).unwrap();
//! let lane = engine.finish_prefetch_operation(0, &proposal).unwrap();
//! assert!(lane.log_likelihood().is_some());
//!
//! engine.reject_all_prefetches().unwrap();
//! assert_eq!(engine.log_likelihood(&tree).unwrap(), before);
//! ```

pub mod buffer;
pub mod buffer_index;
pub mod config;
pub mod likelihood;
pub mod mcmc;
pub mod models;
pub mod orchestrator;
pub mod partials;
pub mod patterns;
pub mod prefetch_index;
pub mod process;
pub mod subst_model;
pub mod traversal;
pub mod tree;

pub use config::{PrefetchConfig, RescalingScheme};
pub use mcmc::{prefetch_mcmc, McmcConfig, McmcResult, McmcSample};
pub use models::SiteRates;
pub use orchestrator::{LaneResult, LaneState, PrefetchCounters, PrefetchLikelihood};
pub use patterns::SitePatterns;
pub use subst_model::{BranchProcess, ReversibleModel, SubstitutionProcess};
pub use tree::{NodeId, PhyloTree, TreeView};

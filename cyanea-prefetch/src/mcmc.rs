//! Prefetching Metropolis-Hastings over branch lengths.
//!
//! Each generation proposes one branch-length scaling per lane, all from the
//! same current tree, and evaluates every lane before any decision is made.
//! Lanes are then tested in order; the first one that passes is promoted and
//! the rest are discarded. If none passes the whole round is rejected.

use cyanea_core::{CyaneaError, Result};
use tracing::{debug, info};

use crate::orchestrator::{LaneResult, PrefetchCounters, PrefetchLikelihood};
use crate::tree::{NodeId, PhyloTree, TreeView};

/// Sampler configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct McmcConfig {
    pub n_generations: usize,
    pub sample_every: usize,
    pub burnin: usize,
    /// Width of the log-scale window for branch multipliers.
    pub scale_factor: f64,
    pub seed: u64,
    /// Mean of the exponential prior on each branch length.
    pub branch_prior_mean: f64,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            n_generations: 10000,
            sample_every: 100,
            burnin: 1000,
            scale_factor: 0.5,
            seed: 42,
            branch_prior_mean: 0.1,
        }
    }
}

impl McmcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_every == 0 {
            return Err(CyaneaError::InvalidInput("sample_every must be at least 1".into()));
        }
        if !(self.scale_factor > 0.0) || !self.scale_factor.is_finite() {
            return Err(CyaneaError::InvalidInput(format!(
                "scale factor must be positive, got {}",
                self.scale_factor
            )));
        }
        if !(self.branch_prior_mean > 0.0) || !self.branch_prior_mean.is_finite() {
            return Err(CyaneaError::InvalidInput(format!(
                "branch prior mean must be positive, got {}",
                self.branch_prior_mean
            )));
        }
        Ok(())
    }
}

/// State of the chain at one sampled generation.
#[derive(Debug, Clone)]
pub struct McmcSample {
    pub generation: usize,
    pub tree: PhyloTree,
    pub log_likelihood: f64,
    pub log_prior: f64,
    pub log_posterior: f64,
}

#[derive(Debug, Clone)]
pub struct McmcResult {
    pub samples: Vec<McmcSample>,
    pub final_tree: PhyloTree,
    /// Accepted proposals over proposals tested.
    pub acceptance_rate: f64,
    /// Engine counters at the end of the run.
    pub counters: PrefetchCounters,
}

/// Simple xorshift64 PRNG.
struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

struct Proposal {
    tree: PhyloTree,
    log_hastings: f64,
    log_prior: f64,
}

/// Run the sampler, starting from `tree`, on an engine built for it.
///
/// The engine's committed state follows the chain: at return it holds the
/// likelihood of `McmcResult::final_tree`.
pub fn prefetch_mcmc(
    engine: &mut PrefetchLikelihood,
    tree: &PhyloTree,
    config: &McmcConfig,
) -> Result<McmcResult> {
    config.validate()?;
    let branches: Vec<NodeId> = (0..tree.node_count()).filter(|&id| !tree.is_root(id)).collect();
    if branches.is_empty() {
        return Err(CyaneaError::InvalidInput("tree has no branches to propose on".into()));
    }

    let mut rng = Xorshift64::new(config.seed);
    let mut current_tree = tree.clone();
    let mut current_ll = engine.log_likelihood(&current_tree)?;
    let mut current_prior = log_prior(&current_tree, config.branch_prior_mean);
    let lanes = engine.lane_count();
    let mut tested = 0usize;
    let mut accepted = 0usize;
    let mut samples = Vec::new();
    info!(lanes, generations = config.n_generations, "starting prefetch MCMC");

    for gen in 0..config.n_generations {
        let mut proposals = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let node = branches[rng.below(branches.len())];
            let proposal = scale_branch(&current_tree, node, config, &mut rng)?;
            engine.start_prefetch_operation(lane)?;
            engine.node_changed(node)?;
            engine.prepare_prefetch(lane, &proposal.tree)?;
            proposals.push(proposal);
        }

        let mut results = engine.evaluate_prepared()?;
        results.sort_by_key(|(lane, _)| *lane);

        let mut winner = None;
        for (lane, result) in results {
            tested += 1;
            let ll = match result {
                LaneResult::LogLikelihood(ll) => ll,
                LaneResult::NonFinite => continue,
            };
            let proposal = &proposals[lane];
            let log_alpha = (ll + proposal.log_prior) - (current_ll + current_prior) + proposal.log_hastings;
            if log_alpha >= 0.0 || rng.next_f64() < log_alpha.exp() {
                winner = Some((lane, ll));
                break;
            }
        }

        match winner {
            Some((lane, ll)) => {
                engine.accept_prefetch(lane)?;
                accepted += 1;
                let proposal = proposals.swap_remove(lane);
                current_tree = proposal.tree;
                current_ll = ll;
                current_prior = proposal.log_prior;
            }
            None => engine.reject_all_prefetches()?,
        }

        if gen >= config.burnin && (gen - config.burnin) % config.sample_every == 0 {
            samples.push(McmcSample {
                generation: gen,
                tree: current_tree.clone(),
                log_likelihood: current_ll,
                log_prior: current_prior,
                log_posterior: current_ll + current_prior,
            });
        }
    }

    let acceptance_rate = if tested > 0 {
        accepted as f64 / tested as f64
    } else {
        0.0
    };
    debug!(acceptance_rate, samples = samples.len(), "prefetch MCMC finished");
    Ok(McmcResult {
        samples,
        final_tree: current_tree,
        acceptance_rate,
        counters: engine.counters(),
    })
}

/// Multiply the branch above `node` by `exp(scale_factor * (u - 0.5))`.
fn scale_branch(
    tree: &PhyloTree,
    node: NodeId,
    config: &McmcConfig,
    rng: &mut Xorshift64,
) -> Result<Proposal> {
    let log_m = config.scale_factor * (rng.next_f64() - 0.5);
    let mut proposed = tree.clone();
    proposed.set_branch_length(node, tree.branch_length(node) * log_m.exp())?;
    Ok(Proposal {
        log_prior: log_prior(&proposed, config.branch_prior_mean),
        tree: proposed,
        log_hastings: log_m,
    })
}

/// Independent exponential priors on every branch length.
fn log_prior(tree: &PhyloTree, mean: f64) -> f64 {
    (0..tree.node_count())
        .filter(|&id| !tree.is_root(id))
        .map(|id| -mean.ln() - tree.branch_length(id) / mean)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefetchConfig;
    use crate::likelihood::tree_log_likelihood;
    use crate::models::SiteRates;
    use crate::patterns::SitePatterns;
    use crate::subst_model::{BranchProcess, ReversibleModel};

    fn setup(lanes: usize) -> (PhyloTree, SitePatterns, PrefetchLikelihood) {
        let mut tree = PhyloTree::new();
        let ab = tree.add_child(0, Some("AB".into()), Some(0.05)).unwrap();
        let cd = tree.add_child(0, Some("CD".into()), Some(0.05)).unwrap();
        tree.add_child(ab, Some("A".into()), Some(0.1)).unwrap();
        tree.add_child(ab, Some("B".into()), Some(0.1)).unwrap();
        tree.add_child(cd, Some("C".into()), Some(0.1)).unwrap();
        tree.add_child(cd, Some("D".into()), Some(0.1)).unwrap();
        let seqs: Vec<&[u8]> = vec![
            b"ACGTACGTACGTACGTAACC",
            b"ACGTACGAACGTACGTAACC",
            b"ACGAACGTACCTACGTTACC",
            b"ACGAACGTACCTACTTTACG",
        ];
        let patterns = SitePatterns::from_sequences(&seqs).unwrap();
        let engine = PrefetchLikelihood::new(
            &tree,
            &patterns,
            BranchProcess::homogeneous(ReversibleModel::jc69()),
            SiteRates::uniform(),
            PrefetchConfig::default().with_lane_count(lanes),
        )
        .unwrap();
        (tree, patterns, engine)
    }

    fn direct(tree: &PhyloTree, patterns: &SitePatterns) -> f64 {
        tree_log_likelihood(
            tree,
            patterns,
            &BranchProcess::homogeneous(ReversibleModel::jc69()),
            &SiteRates::uniform(),
        )
        .unwrap()
    }

    fn short_run() -> McmcConfig {
        McmcConfig {
            n_generations: 200,
            sample_every: 10,
            burnin: 50,
            ..Default::default()
        }
    }

    #[test]
    fn sampled_likelihoods_match_direct_recomputation() {
        let (tree, patterns, mut engine) = setup(3);
        let result = prefetch_mcmc(&mut engine, &tree, &short_run()).unwrap();
        assert_eq!(result.samples.len(), 15);
        for sample in &result.samples {
            let expected = direct(&sample.tree, &patterns);
            assert!(
                (sample.log_likelihood - expected).abs() < 1e-8,
                "generation {}: {} vs {}",
                sample.generation,
                sample.log_likelihood,
                expected
            );
        }
        let committed = engine.log_likelihood(&result.final_tree).unwrap();
        assert!((committed - direct(&result.final_tree, &patterns)).abs() < 1e-8);
    }

    #[test]
    fn acceptance_rate_and_counters() {
        let (tree, _, mut engine) = setup(2);
        let result = prefetch_mcmc(&mut engine, &tree, &short_run()).unwrap();
        assert!(result.acceptance_rate > 0.0 && result.acceptance_rate <= 1.0);
        let c = result.counters;
        assert_eq!(c.accepted_rounds + c.rejected_rounds, 201);
        assert!(c.likelihood_calculations >= 401);
    }

    #[test]
    fn same_seed_same_chain() {
        let (tree, _, mut first) = setup(2);
        let (_, _, mut second) = setup(2);
        let a = prefetch_mcmc(&mut first, &tree, &short_run()).unwrap();
        let b = prefetch_mcmc(&mut second, &tree, &short_run()).unwrap();
        let lls = |r: &McmcResult| r.samples.iter().map(|s| s.log_posterior).collect::<Vec<_>>();
        assert_eq!(lls(&a), lls(&b));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (tree, _, mut engine) = setup(1);
        let config = McmcConfig {
            sample_every: 0,
            ..short_run()
        };
        assert!(prefetch_mcmc(&mut engine, &tree, &config).is_err());
        let config = McmcConfig {
            branch_prior_mean: -1.0,
            ..short_run()
        };
        assert!(config.validate().is_err());
    }
}

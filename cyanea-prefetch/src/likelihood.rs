//! Direct Felsenstein pruning with no caching.
//!
//! Recomputes every transition matrix and every partial on each call. The
//! cached engine in [`crate::orchestrator`] must agree with it, which makes
//! it the reference for "directly recomputed" likelihoods.

use cyanea_core::{CyaneaError, Result};

use crate::models::SiteRates;
use crate::patterns::SitePatterns;
use crate::subst_model::{BranchProcess, EigenDecomposition, SubstitutionProcess};
use crate::tree::{NodeId, PhyloTree, TreeView};

/// Log-likelihood of `tree` for an alignment whose rows follow the tips'
/// name order.
pub fn tree_log_likelihood(
    tree: &PhyloTree,
    patterns: &SitePatterns,
    process: &BranchProcess,
    rates: &SiteRates,
) -> Result<f64> {
    let tips = tree.leaves_by_name();
    if tips.len() != patterns.taxon_count() {
        return Err(CyaneaError::InvalidInput(format!(
            "expected {} sequences for {} leaves, got {}",
            tips.len(),
            tips.len(),
            patterns.taxon_count()
        )));
    }
    let tip_partials: Vec<(NodeId, Vec<f64>)> = tips
        .iter()
        .enumerate()
        .map(|(taxon, &node)| (node, patterns.tip_partials(taxon)))
        .collect();
    let sites = site_log_likelihoods(tree, &tip_partials, patterns.pattern_count(), process, rates)?;
    Ok(sites
        .iter()
        .zip(patterns.weights())
        .map(|(ll, w)| ll * w)
        .sum())
}

/// Per-pattern log-likelihoods from explicit tip partials.
///
/// `tips` pairs each leaf with its pattern-major `[pattern][state]`
/// partials. Partials are rescaled at every internal node, so tiny tip
/// values do not underflow.
pub fn site_log_likelihoods(
    tree: &dyn TreeView,
    tips: &[(NodeId, Vec<f64>)],
    pattern_count: usize,
    process: &BranchProcess,
    rates: &SiteRates,
) -> Result<Vec<f64>> {
    let n = process.state_count();
    let n_nodes = tree.node_count();
    let eigens: Vec<EigenDecomposition> = (0..process.class_count())
        .map(|c| process.eigen_decomposition(c))
        .collect::<Result<_>>()?;

    let mut tip_of: Vec<Option<&[f64]>> = vec![None; n_nodes];
    for (node, partials) in tips {
        if *node >= n_nodes || partials.len() != pattern_count * n {
            return Err(CyaneaError::InvalidInput(format!(
                "tip partials for node {} have the wrong shape",
                node
            )));
        }
        tip_of[*node] = Some(partials);
    }

    let postorder = tree.postorder();
    let mut depth = vec![0.0; n_nodes];
    for &id in postorder.iter().rev() {
        if let Some(p) = tree.parent(id) {
            depth[id] = depth[p] + tree.branch_length(id);
        }
    }

    let mut site_lls = vec![0.0; pattern_count];
    let mut site_likelihood = vec![0.0; pattern_count];
    let mut site_scale = vec![0.0; pattern_count];

    for (cat, (&rate, &proportion)) in rates.rates().iter().zip(rates.proportions()).enumerate() {
        // P(t) of the branch above each node for this category.
        let mut matrices: Vec<Vec<f64>> = vec![Vec::new(); n_nodes];
        for &id in &postorder {
            if let Some(p) = tree.parent(id) {
                let length = tree.branch_length(id);
                let mapping = process.branch_mapping(depth[p], length);
                let mut m = identity(n);
                for (&class, &weight) in mapping.order.iter().zip(&mapping.weights) {
                    let seg = eigens[class].transition_matrix(length * rate * weight);
                    m = multiply(&m, &seg, n);
                }
                matrices[id] = m;
            }
        }

        for pattern in 0..pattern_count {
            let mut partials = vec![vec![0.0; n]; n_nodes];
            let mut log_scale = 0.0;
            for &id in &postorder {
                let children = tree.children(id);
                if children.is_empty() {
                    match tip_of[id] {
                        Some(tip) => partials[id].copy_from_slice(&tip[pattern * n..(pattern + 1) * n]),
                        None => partials[id].iter_mut().for_each(|v| *v = 1.0),
                    }
                } else {
                    for s in 0..n {
                        let mut product = 1.0;
                        for &child in children {
                            let m = &matrices[child];
                            let sum: f64 = (0..n).map(|t| m[s * n + t] * partials[child][t]).sum();
                            product *= sum;
                        }
                        partials[id][s] = product;
                    }
                }
                let max = partials[id].iter().cloned().fold(0.0, f64::max);
                if max > 0.0 && max != 1.0 {
                    partials[id].iter_mut().for_each(|v| *v /= max);
                    log_scale += max.ln();
                }
            }
            let root = tree.root();
            let freqs = process.root_frequencies();
            let cat_likelihood: f64 = (0..n).map(|s| freqs[s] * partials[root][s]).sum();

            // mix categories in a shared scale
            if cat == 0 {
                site_scale[pattern] = log_scale;
                site_likelihood[pattern] = proportion * cat_likelihood;
            } else {
                let shift = log_scale - site_scale[pattern];
                if shift > 0.0 {
                    site_likelihood[pattern] =
                        site_likelihood[pattern] * (-shift).exp() + proportion * cat_likelihood;
                    site_scale[pattern] = log_scale;
                } else {
                    site_likelihood[pattern] += proportion * cat_likelihood * shift.exp();
                }
            }
        }
    }

    for pattern in 0..pattern_count {
        site_lls[pattern] = site_likelihood[pattern].ln() + site_scale[pattern];
    }
    Ok(site_lls)
}

fn identity(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

fn multiply(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![0.0; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..n {
                out[i * n + j] += aik * b[k * n + j];
            }
        }
    }
    out
}

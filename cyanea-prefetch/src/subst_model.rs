//! Reversible substitution models, their eigen-decompositions, and the closed
//! set of process shapes that feed the likelihood engine.
//!
//! A [`ReversibleModel`] is an exchangeability matrix plus equilibrium
//! frequencies. Its rate matrix is diagonalised once through the symmetric
//! form `B = diag(sqrt(pi)) * Q * diag(1/sqrt(pi))`, after which every
//! transition matrix is a cheap reconstruction
//! `P(t) = E * exp(Lambda*t) * E^-1`.
//!
//! A [`BranchProcess`] decides which models act along a branch:
//! one model everywhere, time-sliced epochs, or a fixed chain of models.

use cyanea_core::{CyaneaError, Result};

/// Capabilities the evolutionary-process delegate needs from a model layer.
pub trait SubstitutionProcess {
    /// Number of character states.
    fn state_count(&self) -> usize;

    /// Number of distinct eigen systems (one per model).
    fn class_count(&self) -> usize;

    /// Eigen-decomposition of model class `class`.
    fn eigen_decomposition(&self, class: usize) -> Result<EigenDecomposition>;

    /// State frequencies used to integrate the root partials.
    fn root_frequencies(&self) -> &[f64];

    /// Which classes act along a branch and for what fraction of its length.
    ///
    /// `start_depth` is the distance from the root to the upper end of the
    /// branch.
    fn branch_mapping(&self, start_depth: f64, length: f64) -> BranchMapping;

    /// True if a branch's mapping depends on where the branch sits in the tree.
    fn depends_on_depth(&self) -> bool;
}

/// Classes acting along one branch, upper segment first.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchMapping {
    /// Model class of each segment.
    pub order: Vec<usize>,
    /// Fraction of the branch length spent in each segment.
    pub weights: Vec<f64>,
}

impl BranchMapping {
    /// The whole branch under one class.
    pub fn single(class: usize) -> Self {
        Self {
            order: vec![class],
            weights: vec![1.0],
        }
    }
}

/// Eigen system of a rate matrix `Q = E * diag(lambda) * E^-1`.
///
/// Matrices are stored row-major in flat vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    state_count: usize,
    eigenvectors: Vec<f64>,
    inverse_eigenvectors: Vec<f64>,
    eigenvalues: Vec<f64>,
}

impl EigenDecomposition {
    pub fn new(
        eigenvectors: Vec<f64>,
        inverse_eigenvectors: Vec<f64>,
        eigenvalues: Vec<f64>,
    ) -> Result<Self> {
        let n = eigenvalues.len();
        if n == 0 || eigenvectors.len() != n * n || inverse_eigenvectors.len() != n * n {
            return Err(CyaneaError::InvalidInput(format!(
                "eigen system shape mismatch: {} values, {} and {} vector entries",
                n,
                eigenvectors.len(),
                inverse_eigenvectors.len()
            )));
        }
        Ok(Self {
            state_count: n,
            eigenvectors,
            inverse_eigenvectors,
            eigenvalues,
        })
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn eigenvectors(&self) -> &[f64] {
        &self.eigenvectors
    }

    pub fn inverse_eigenvectors(&self) -> &[f64] {
        &self.inverse_eigenvectors
    }

    /// True if every stored entry is finite.
    pub fn is_finite(&self) -> bool {
        self.eigenvalues
            .iter()
            .chain(&self.eigenvectors)
            .chain(&self.inverse_eigenvectors)
            .all(|v| v.is_finite())
    }

    /// Write `P(t)` into `out` (row-major, `n*n`).
    ///
    /// Uses `P(t) = I + E * diag(expm1(lambda*t)) * E^-1`, which keeps the
    /// off-diagonal entries accurate when `t` is tiny; entries that round
    /// below zero are clamped.
    pub fn transition_matrix_into(&self, t: f64, out: &mut [f64]) {
        let n = self.state_count;
        let growth: Vec<f64> = self.eigenvalues.iter().map(|&l| (l * t).exp_m1()).collect();
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += self.eigenvectors[i * n + k]
                        * growth[k]
                        * self.inverse_eigenvectors[k * n + j];
                }
                if i == j {
                    sum += 1.0;
                }
                out[i * n + j] = if sum < 0.0 && sum > -1e-12 { 0.0 } else { sum };
            }
        }
    }

    /// `P(t)` as a fresh row-major vector.
    pub fn transition_matrix(&self, t: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.state_count * self.state_count];
        self.transition_matrix_into(t, &mut out);
        out
    }
}

/// A time-reversible substitution model.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReversibleModel {
    exchangeabilities: Vec<Vec<f64>>,
    freqs: Vec<f64>,
}

impl ReversibleModel {
    /// Build from a symmetric exchangeability matrix and equilibrium frequencies.
    ///
    /// # Errors
    ///
    /// Returns an error for mismatched shapes, an asymmetric or negative
    /// exchangeability matrix, or frequencies that are not positive and
    /// summing to 1.
    pub fn new(exchangeabilities: Vec<Vec<f64>>, freqs: Vec<f64>) -> Result<Self> {
        let n = freqs.len();
        if n < 2 || exchangeabilities.len() != n || exchangeabilities.iter().any(|r| r.len() != n) {
            return Err(CyaneaError::InvalidInput(format!(
                "exchangeabilities must be {}x{}",
                n, n
            )));
        }
        for i in 0..n {
            for j in 0..n {
                let s = exchangeabilities[i][j];
                if i != j && (!s.is_finite() || s < 0.0 || (s - exchangeabilities[j][i]).abs() > 1e-12) {
                    return Err(CyaneaError::InvalidInput(format!(
                        "exchangeability ({}, {}) must be finite, non-negative and symmetric",
                        i, j
                    )));
                }
            }
        }
        let total: f64 = freqs.iter().sum();
        if freqs.iter().any(|&f| !(f > 0.0)) || (total - 1.0).abs() > 1e-6 {
            return Err(CyaneaError::InvalidInput(format!(
                "frequencies must be positive and sum to 1, got sum {}",
                total
            )));
        }
        Ok(Self {
            exchangeabilities,
            freqs,
        })
    }

    /// Jukes-Cantor: equal rates, equal frequencies.
    pub fn jc69() -> Self {
        Self {
            exchangeabilities: nucleotide_exchangeabilities([1.0; 6]),
            freqs: vec![0.25; 4],
        }
    }

    /// Kimura two-parameter: transition/transversion ratio `kappa`.
    pub fn k80(kappa: f64) -> Result<Self> {
        Self::hky85(kappa, [0.25; 4])
    }

    /// HKY85: `kappa` with unequal base frequencies (A, C, G, T).
    pub fn hky85(kappa: f64, freqs: [f64; 4]) -> Result<Self> {
        if !kappa.is_finite() || kappa <= 0.0 {
            return Err(CyaneaError::InvalidInput(format!(
                "kappa must be positive, got {}",
                kappa
            )));
        }
        // AC AG AT CG CT GT; transitions are AG and CT.
        Self::gtr([1.0, kappa, 1.0, 1.0, kappa, 1.0], freqs)
    }

    /// GTR with rates in the order AC, AG, AT, CG, CT, GT.
    pub fn gtr(rates: [f64; 6], freqs: [f64; 4]) -> Result<Self> {
        Self::new(nucleotide_exchangeabilities(rates), freqs.to_vec())
    }

    pub fn state_count(&self) -> usize {
        self.freqs.len()
    }

    /// Equilibrium frequencies, one per state.
    pub fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    /// Normalised rate matrix Q (mean rate 1 at equilibrium).
    pub fn rate_matrix(&self) -> Vec<Vec<f64>> {
        build_rate_matrix(&self.exchangeabilities, &self.freqs)
    }

    /// Diagonalise Q through its symmetric similarity transform.
    pub fn eigen_decomposition(&self) -> Result<EigenDecomposition> {
        let n = self.state_count();
        let q = self.rate_matrix();
        let sqrt_pi: Vec<f64> = self.freqs.iter().map(|f| f.sqrt()).collect();

        let mut b = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                b[i * n + j] = sqrt_pi[i] * q[i][j] / sqrt_pi[j];
            }
        }
        // Average away rounding asymmetry before the Jacobi sweep.
        for i in 0..n {
            for j in (i + 1)..n {
                let avg = 0.5 * (b[i * n + j] + b[j * n + i]);
                b[i * n + j] = avg;
                b[j * n + i] = avg;
            }
        }

        let (values, u) = symmetric_eigen(b, n)?;

        // E = diag(1/sqrt(pi)) * U, E^-1 = U^T * diag(sqrt(pi))
        let mut vectors = vec![0.0; n * n];
        let mut inverse = vec![0.0; n * n];
        for i in 0..n {
            for k in 0..n {
                vectors[i * n + k] = u[i * n + k] / sqrt_pi[i];
                inverse[k * n + i] = u[i * n + k] * sqrt_pi[i];
            }
        }
        EigenDecomposition::new(vectors, inverse, values)
    }
}

fn nucleotide_exchangeabilities(rates: [f64; 6]) -> Vec<Vec<f64>> {
    let [ac, ag, at, cg, ct, gt] = rates;
    vec![
        vec![0.0, ac, ag, at],
        vec![ac, 0.0, cg, ct],
        vec![ag, cg, 0.0, gt],
        vec![at, ct, gt, 0.0],
    ]
}

/// Build a normalized rate matrix Q from exchangeability matrix S and frequencies pi.
///
/// Q\[i\]\[j\] = S\[i\]\[j\] * pi\[j\] for i != j, rows sum to 0,
/// normalized so -sum(pi_i * Q_ii) = 1.
pub(crate) fn build_rate_matrix(exchangeabilities: &[Vec<f64>], freqs: &[f64]) -> Vec<Vec<f64>> {
    let n = freqs.len();
    let mut q = vec![vec![0.0; n]; n];

    for i in 0..n {
        for j in 0..n {
            if i != j {
                q[i][j] = exchangeabilities[i][j] * freqs[j];
            }
        }
        let off_diag: f64 = (0..n).filter(|&j| j != i).map(|j| q[i][j]).sum();
        q[i][i] = -off_diag;
    }

    let mu: f64 = (0..n).map(|i| -freqs[i] * q[i][i]).sum();
    if mu > 0.0 {
        for row in q.iter_mut() {
            for v in row.iter_mut() {
                *v /= mu;
            }
        }
    }
    q
}

/// Cyclic Jacobi eigen-solver for a real symmetric `n x n` matrix (row-major).
///
/// Returns eigenvalues and the row-major eigenvector matrix whose column
/// `k` pairs with eigenvalue `k`.
pub(crate) fn symmetric_eigen(mut a: Vec<f64>, n: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }
    let scale: f64 = a.iter().map(|x| x * x).sum::<f64>().max(f64::MIN_POSITIVE);

    let mut converged = false;
    for _sweep in 0..100 {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[p * n + q] * a[p * n + q])
            .sum();
        if off <= 1e-30 * scale {
            converged = true;
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }
    if !converged {
        return Err(CyaneaError::Computation(
            "Jacobi eigen-decomposition did not converge".into(),
        ));
    }
    let values = (0..n).map(|i| a[i * n + i]).collect();
    Ok((values, v))
}

/// The closed set of substitution-process shapes, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchProcess {
    /// One model on every branch.
    Homogeneous(ReversibleModel),
    /// Models switch at fixed distances from the root; `boundaries[k]`
    /// separates epoch `k` (closer to the root) from epoch `k + 1`.
    Epoch {
        models: Vec<ReversibleModel>,
        boundaries: Vec<f64>,
    },
    /// Every branch runs through each model in turn for a fixed fraction
    /// of its length.
    ProductChain {
        models: Vec<ReversibleModel>,
        weights: Vec<f64>,
    },
}

impl BranchProcess {
    pub fn homogeneous(model: ReversibleModel) -> Self {
        Self::Homogeneous(model)
    }

    /// Epoch process; boundaries must be positive and strictly increasing,
    /// one fewer than the models.
    ///
    /// Boundaries are depths measured down from the root, not heights above
    /// the tips: `models[0]` covers depths below `boundaries[0]`.
    pub fn epoch(models: Vec<ReversibleModel>, boundaries: Vec<f64>) -> Result<Self> {
        check_same_shape(&models)?;
        if boundaries.len() + 1 != models.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "{} epoch models need {} boundaries, got {}",
                models.len(),
                models.len() - 1,
                boundaries.len()
            )));
        }
        let increasing = boundaries.windows(2).all(|w| w[0] < w[1]);
        if !increasing || boundaries.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(CyaneaError::InvalidInput(
                "epoch boundaries must be positive and strictly increasing".into(),
            ));
        }
        Ok(Self::Epoch { models, boundaries })
    }

    /// Product chain; weights are normalised to sum to 1.
    pub fn product_chain(models: Vec<ReversibleModel>, weights: Vec<f64>) -> Result<Self> {
        check_same_shape(&models)?;
        if weights.len() != models.len() || weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(CyaneaError::InvalidInput(
                "product chain needs one positive weight per model".into(),
            ));
        }
        let total: f64 = weights.iter().sum();
        let weights = weights.iter().map(|w| w / total).collect();
        Ok(Self::ProductChain { models, weights })
    }

    fn models(&self) -> &[ReversibleModel] {
        match self {
            Self::Homogeneous(model) => std::slice::from_ref(model),
            Self::Epoch { models, .. } | Self::ProductChain { models, .. } => models,
        }
    }

    /// True if `other` can replace this process without resizing any buffer.
    pub fn same_shape(&self, other: &BranchProcess) -> bool {
        self.class_count() == other.class_count()
            && self.state_count() == other.state_count()
            && std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

fn check_same_shape(models: &[ReversibleModel]) -> Result<()> {
    let first = models
        .first()
        .ok_or_else(|| CyaneaError::InvalidInput("at least one model is required".into()))?;
    if models.iter().any(|m| m.state_count() != first.state_count()) {
        return Err(CyaneaError::InvalidInput(
            "all models must share one state space".into(),
        ));
    }
    Ok(())
}

impl SubstitutionProcess for BranchProcess {
    fn state_count(&self) -> usize {
        self.models()[0].state_count()
    }

    fn class_count(&self) -> usize {
        self.models().len()
    }

    fn eigen_decomposition(&self, class: usize) -> Result<EigenDecomposition> {
        self.models()
            .get(class)
            .ok_or_else(|| CyaneaError::InvalidInput(format!("no model class {}", class)))?
            .eigen_decomposition()
    }

    fn root_frequencies(&self) -> &[f64] {
        self.models()[0].frequencies()
    }

    fn branch_mapping(&self, start_depth: f64, length: f64) -> BranchMapping {
        match self {
            Self::Homogeneous(_) => BranchMapping::single(0),
            Self::ProductChain { weights, .. } => BranchMapping {
                order: (0..weights.len()).collect(),
                weights: weights.clone(),
            },
            Self::Epoch { boundaries, .. } => epoch_mapping(boundaries, start_depth, length),
        }
    }

    fn depends_on_depth(&self) -> bool {
        matches!(self, Self::Epoch { .. })
    }
}

fn epoch_mapping(boundaries: &[f64], start: f64, length: f64) -> BranchMapping {
    let epoch_of = |depth: f64| boundaries.iter().take_while(|&&b| b <= depth).count();
    if length <= 0.0 {
        return BranchMapping::single(epoch_of(start));
    }
    let end = start + length;
    let mut order = Vec::new();
    let mut weights = Vec::new();
    for k in 0..=boundaries.len() {
        let lo = if k == 0 { f64::NEG_INFINITY } else { boundaries[k - 1] };
        let hi = boundaries.get(k).copied().unwrap_or(f64::INFINITY);
        let overlap = end.min(hi) - start.max(lo);
        if overlap > 0.0 {
            order.push(k);
            weights.push(overlap / length);
        }
    }
    if order.len() == 1 {
        weights = vec![1.0];
    }
    BranchMapping { order, weights }
}

//! Nucleotide coding, the closed-form JC69 matrix, and site-rate categories.
//!
//! The substitution processes themselves live in [`crate::subst_model`];
//! this module holds the small pieces both the cached engine and the direct
//! reference likelihood share.

use cyanea_core::{CyaneaError, Result};

/// Number of nucleotide states in DNA models.
pub const NUM_STATES: usize = 4;

/// Map a nucleotide byte to an index (A=0, C=1, G=2, T=3).
///
/// Accepts both upper and lower case, and `U` as `T`. Returns `None` for
/// gaps and ambiguity codes.
pub fn nucleotide_index(b: u8) -> Option<usize> {
    match b.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' | b'U' => Some(3),
        _ => None,
    }
}

/// JC69 transition probability matrix for a given branch length `t`.
///
/// - P(same) = 1/4 + 3/4 * e^{-4t/3}
/// - P(diff) = 1/4 - 1/4 * e^{-4t/3}
///
/// Written with `exp_m1` so the off-diagonal stays accurate for tiny `t`.
pub fn jc69_probability(t: f64) -> [[f64; 4]; 4] {
    let em1 = (-4.0 * t / 3.0).exp_m1();
    let p_same = 1.0 + 0.75 * em1;
    let p_diff = -0.25 * em1;

    let mut p = [[p_diff; 4]; 4];
    for (i, row) in p.iter_mut().enumerate() {
        row[i] = p_same;
    }
    p
}

/// Among-site rate heterogeneity as discrete categories.
///
/// Each category multiplies every branch length by its rate; site
/// likelihoods are mixed with the category proportions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SiteRates {
    rates: Vec<f64>,
    proportions: Vec<f64>,
}

impl SiteRates {
    /// A single category with rate 1.
    pub fn uniform() -> Self {
        Self {
            rates: vec![1.0],
            proportions: vec![1.0],
        }
    }

    /// Explicit category rates and mixing proportions.
    ///
    /// # Errors
    ///
    /// Returns an error if the vectors are empty or differ in length, if a
    /// rate is negative or non-finite, or if the proportions do not sum to 1.
    pub fn new(rates: Vec<f64>, proportions: Vec<f64>) -> Result<Self> {
        if rates.is_empty() || rates.len() != proportions.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "need matching non-empty rates and proportions, got {} and {}",
                rates.len(),
                proportions.len()
            )));
        }
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(CyaneaError::InvalidInput(
                "category rates must be finite and non-negative".into(),
            ));
        }
        let total: f64 = proportions.iter().sum();
        if proportions.iter().any(|p| *p < 0.0) || (total - 1.0).abs() > 1e-8 {
            return Err(CyaneaError::InvalidInput(format!(
                "category proportions must be non-negative and sum to 1, got {}",
                total
            )));
        }
        Ok(Self { rates, proportions })
    }

    /// `n` equally weighted categories with the given rates.
    pub fn equal_weights(rates: Vec<f64>) -> Result<Self> {
        let n = rates.len().max(1);
        Self::new(rates, vec![1.0 / n as f64; n])
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn proportions(&self) -> &[f64] {
        &self.proportions
    }

    /// Number of categories.
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl Default for SiteRates {
    fn default() -> Self {
        Self::uniform()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nucleotide_index_standard_and_lowercase() {
        for (i, b) in b"ACGT".iter().enumerate() {
            assert_eq!(nucleotide_index(*b), Some(i));
            assert_eq!(nucleotide_index(b.to_ascii_lowercase()), Some(i));
        }
        assert_eq!(nucleotide_index(b'U'), Some(3));
        assert_eq!(nucleotide_index(b'N'), None);
        assert_eq!(nucleotide_index(b'-'), None);
    }

    #[test]
    fn jc69_t_zero_is_identity() {
        let p = jc69_probability(0.0);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (p[i][j] - expected).abs() < 1e-15,
                    "P[{}][{}] = {}",
                    i,
                    j,
                    p[i][j]
                );
            }
        }
    }

    #[test]
    fn jc69_known_value() {
        // At t = 0.3: e^{-4*0.3/3} = e^{-0.4}
        let e = (-0.4_f64).exp();
        let p = jc69_probability(0.3);
        assert!((p[0][0] - (0.25 + 0.75 * e)).abs() < 1e-12);
        assert!((p[0][1] - (0.25 - 0.25 * e)).abs() < 1e-12);
    }

    #[test]
    fn jc69_tiny_branch_keeps_precision() {
        let t = 1e-12;
        let p = jc69_probability(t);
        // off-diagonal ~ t/3 to first order
        assert!((p[0][1] / (t / 3.0) - 1.0).abs() < 1e-6, "got {}", p[0][1]);
    }

    #[test]
    fn jc69_rows_sum_to_one() {
        for &t in &[0.0, 0.01, 0.1, 1.0, 100.0] {
            let p = jc69_probability(t);
            for row in &p {
                let sum: f64 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-12, "row sum {} at t = {}", sum, t);
            }
        }
    }

    #[test]
    fn site_rates_validation() {
        assert!(SiteRates::new(vec![], vec![]).is_err());
        assert!(SiteRates::new(vec![1.0], vec![0.5]).is_err());
        assert!(SiteRates::new(vec![-1.0, 1.0], vec![0.5, 0.5]).is_err());
        let rates = SiteRates::equal_weights(vec![0.5, 1.5]).unwrap();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates.proportions(), &[0.5, 0.5]);
        assert_eq!(SiteRates::default(), SiteRates::uniform());
    }
}

//! Alignment compression into weighted site patterns and tip partials.

use std::collections::HashMap;

use cyanea_core::{CyaneaError, Result};

use crate::models::{nucleotide_index, NUM_STATES};

/// Unique alignment columns with their multiplicities.
///
/// Taxa are rows in the order the sequences were given; the engine pairs
/// them with tips sorted by name.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SitePatterns {
    columns: Vec<Vec<u8>>,
    weights: Vec<f64>,
    site_to_pattern: Vec<usize>,
    taxon_count: usize,
}

impl SitePatterns {
    /// Collapse identical columns (case-insensitive), keeping first-seen order.
    ///
    /// # Errors
    ///
    /// Returns an error for no sequences, empty sequences, or ragged lengths.
    pub fn from_sequences(sequences: &[&[u8]]) -> Result<Self> {
        let first = sequences
            .first()
            .ok_or_else(|| CyaneaError::InvalidInput("no sequences provided".into()))?;
        let site_count = first.len();
        if site_count == 0 {
            return Err(CyaneaError::InvalidInput("empty sequences".into()));
        }
        for (i, seq) in sequences.iter().enumerate() {
            if seq.len() != site_count {
                return Err(CyaneaError::InvalidInput(format!(
                    "sequence {} has length {}, expected {}",
                    i,
                    seq.len(),
                    site_count
                )));
            }
        }

        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut columns = Vec::new();
        let mut weights = Vec::new();
        let mut site_to_pattern = Vec::with_capacity(site_count);
        for site in 0..site_count {
            let column: Vec<u8> = sequences
                .iter()
                .map(|s| s[site].to_ascii_uppercase())
                .collect();
            let pattern = *index.entry(column.clone()).or_insert_with(|| {
                columns.push(column);
                weights.push(0.0);
                columns.len() - 1
            });
            weights[pattern] += 1.0;
            site_to_pattern.push(pattern);
        }

        Ok(Self {
            columns,
            weights,
            site_to_pattern,
            taxon_count: sequences.len(),
        })
    }

    pub fn pattern_count(&self) -> usize {
        self.columns.len()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxon_count
    }

    pub fn site_count(&self) -> usize {
        self.site_to_pattern.len()
    }

    /// Number of alignment columns each pattern stands for.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// States of every taxon in pattern `pattern`.
    pub fn pattern(&self, pattern: usize) -> &[u8] {
        &self.columns[pattern]
    }

    /// Pattern index of alignment column `site`.
    pub fn site_pattern(&self, site: usize) -> usize {
        self.site_to_pattern[site]
    }

    /// Tip partials of `taxon`, pattern-major (`pattern_count * 4` values).
    ///
    /// Observed bases are indicator vectors, IUPAC ambiguity codes mark
    /// each compatible base, and gaps or unknown symbols are all ones.
    pub fn tip_partials(&self, taxon: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.columns.len() * NUM_STATES);
        for column in &self.columns {
            out.extend_from_slice(&nucleotide_partials(column[taxon]));
        }
        out
    }
}

/// Partial-likelihood vector of one nucleotide symbol.
pub fn nucleotide_partials(symbol: u8) -> [f64; NUM_STATES] {
    if let Some(state) = nucleotide_index(symbol) {
        let mut v = [0.0; NUM_STATES];
        v[state] = 1.0;
        return v;
    }
    let bases: &[usize] = match symbol.to_ascii_uppercase() {
        b'R' => &[0, 2],
        b'Y' => &[1, 3],
        b'S' => &[1, 2],
        b'W' => &[0, 3],
        b'K' => &[2, 3],
        b'M' => &[0, 1],
        b'B' => &[1, 2, 3],
        b'D' => &[0, 2, 3],
        b'H' => &[0, 1, 3],
        b'V' => &[0, 1, 2],
        _ => return [1.0; NUM_STATES],
    };
    let mut v = [0.0; NUM_STATES];
    for &b in bases {
        v[b] = 1.0;
    }
    v
}

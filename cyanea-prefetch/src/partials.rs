//! Partial-likelihood buffers, the pruning step, and root integration.
//!
//! Values are laid out category-major: `[category][pattern][state]`. Each
//! buffer also carries a cumulative natural-log scale factor per pattern so
//! rescaled and unscaled buffers can be mixed freely.

/// Dimensions shared by every partials buffer of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialsLayout {
    pub patterns: usize,
    pub categories: usize,
    pub states: usize,
}

impl PartialsLayout {
    /// Number of values in one buffer.
    pub fn len(&self) -> usize {
        self.patterns * self.categories * self.states
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn offset(&self, category: usize, pattern: usize) -> usize {
        (category * self.patterns + pattern) * self.states
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialsBuffer {
    pub values: Vec<f64>,
    /// Sum of ln(scale factor) applied to each pattern in this subtree.
    pub log_scale: Vec<f64>,
}

impl PartialsBuffer {
    pub fn zeros(layout: &PartialsLayout) -> Self {
        Self {
            values: vec![0.0; layout.len()],
            log_scale: vec![0.0; layout.patterns],
        }
    }

    /// Tip buffer from pattern-major `[pattern][state]` partials, repeated
    /// for every category.
    pub fn from_tip(layout: &PartialsLayout, tip: &[f64]) -> Self {
        let mut buffer = Self::zeros(layout);
        buffer.set_tip(layout, tip);
        buffer
    }

    /// Overwrite with tip partials and clear the scale factors.
    pub fn set_tip(&mut self, layout: &PartialsLayout, tip: &[f64]) {
        let block = layout.patterns * layout.states;
        for category in 0..layout.categories {
            self.values[category * block..(category + 1) * block].copy_from_slice(&tip[..block]);
        }
        self.log_scale.iter_mut().for_each(|s| *s = 0.0);
    }

    /// Divide each pattern by its largest entry and move that factor into
    /// `log_scale`.
    pub fn normalize(&mut self, layout: &PartialsLayout) {
        for pattern in 0..layout.patterns {
            let mut max = 0.0f64;
            for category in 0..layout.categories {
                let at = layout.offset(category, pattern);
                for v in &self.values[at..at + layout.states] {
                    max = max.max(*v);
                }
            }
            if max > 0.0 && max.is_finite() && max != 1.0 {
                for category in 0..layout.categories {
                    let at = layout.offset(category, pattern);
                    for v in &mut self.values[at..at + layout.states] {
                        *v /= max;
                    }
                }
                self.log_scale[pattern] += max.ln();
            }
        }
    }
}

/// Result of integrating the root partials.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RootOutcome {
    LogLikelihood(f64),
    /// A site likelihood fell below the rescale threshold while unscaled.
    Underflow,
    /// The model produced NaN or an infinite likelihood.
    NonFinite,
}

/// One Felsenstein pruning step.
///
/// `children` pairs each child's partials with the transition matrices of
/// the branch above it (`[category][from][to]`).
pub fn update_partials(
    dest: &mut PartialsBuffer,
    children: &[(&PartialsBuffer, &[f64])],
    layout: &PartialsLayout,
    rescale: bool,
) {
    let n = layout.states;
    for pattern in 0..layout.patterns {
        dest.log_scale[pattern] = children.iter().map(|(c, _)| c.log_scale[pattern]).sum();
    }
    for category in 0..layout.categories {
        let matrix_at = category * n * n;
        for pattern in 0..layout.patterns {
            let at = layout.offset(category, pattern);
            for i in 0..n {
                let mut product = 1.0;
                for (child, matrix) in children {
                    let row = &matrix[matrix_at + i * n..matrix_at + (i + 1) * n];
                    let partial = &child.values[at..at + n];
                    product *= row.iter().zip(partial).map(|(p, x)| p * x).sum::<f64>();
                }
                dest.values[at + i] = product;
            }
        }
    }
    if rescale {
        dest.normalize(layout);
    }
}

/// Integrate root partials into the pattern-weighted log-likelihood.
///
/// With `underflow_threshold` set, any site likelihood below it returns
/// [`RootOutcome::Underflow`] instead of a value.
pub fn integrate_root(
    root: &PartialsBuffer,
    layout: &PartialsLayout,
    frequencies: &[f64],
    proportions: &[f64],
    pattern_weights: &[f64],
    underflow_threshold: Option<f64>,
) -> RootOutcome {
    let mut total = 0.0;
    for pattern in 0..layout.patterns {
        let mut site = 0.0;
        for (category, &proportion) in proportions.iter().enumerate() {
            let at = layout.offset(category, pattern);
            let partial = &root.values[at..at + layout.states];
            site += proportion * frequencies.iter().zip(partial).map(|(f, x)| f * x).sum::<f64>();
        }
        if site.is_nan() {
            return RootOutcome::NonFinite;
        }
        if underflow_threshold.map_or(false, |threshold| site < threshold) {
            return RootOutcome::Underflow;
        }
        total += pattern_weights[pattern] * (site.ln() + root.log_scale[pattern]);
    }
    if total.is_nan() || total == f64::INFINITY {
        RootOutcome::NonFinite
    } else {
        RootOutcome::LogLikelihood(total)
    }
}

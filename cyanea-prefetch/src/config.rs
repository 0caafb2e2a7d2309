//! Engine configuration.

use cyanea_core::{CyaneaError, Result};

/// When partial likelihoods are rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RescalingScheme {
    /// Run unscaled until the first underflow, then rescale for the rest
    /// of the run.
    #[default]
    Dynamic,
    /// Rescale at every node from the start.
    Always,
    /// Never rescale; underflow shows up as a `-inf` log-likelihood.
    Never,
}

/// Settings fixed when a [`crate::PrefetchLikelihood`] is built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PrefetchConfig {
    /// Number of speculative lanes.
    pub lane_count: usize,
    /// Unscaled site likelihoods below this raise the rescale signal.
    pub rescale_threshold: f64,
    /// Rescale-and-retry cycles allowed per evaluation before giving up.
    pub max_underflow_retries: usize,
    pub rescaling: RescalingScheme,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            lane_count: 2,
            rescale_threshold: f64::MIN_POSITIVE,
            max_underflow_retries: 100,
            rescaling: RescalingScheme::Dynamic,
        }
    }
}

impl PrefetchConfig {
    pub fn with_lane_count(mut self, lane_count: usize) -> Self {
        self.lane_count = lane_count;
        self
    }

    pub fn with_rescale_threshold(mut self, threshold: f64) -> Self {
        self.rescale_threshold = threshold;
        self
    }

    pub fn with_max_underflow_retries(mut self, retries: usize) -> Self {
        self.max_underflow_retries = retries;
        self
    }

    pub fn with_rescaling(mut self, scheme: RescalingScheme) -> Self {
        self.rescaling = scheme;
        self
    }

    /// Check that the settings can build an engine.
    pub fn validate(&self) -> Result<()> {
        if self.lane_count == 0 {
            return Err(CyaneaError::InvalidInput("lane count must be at least 1".into()));
        }
        if !(self.rescale_threshold >= 0.0) || !self.rescale_threshold.is_finite() {
            return Err(CyaneaError::InvalidInput(format!(
                "rescale threshold must be finite and non-negative, got {}",
                self.rescale_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PrefetchConfig::default();
        assert_eq!(config.lane_count, 2);
        assert_eq!(config.max_underflow_retries, 100);
        assert_eq!(config.rescaling, RescalingScheme::Dynamic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_and_validation() {
        let config = PrefetchConfig::default()
            .with_lane_count(4)
            .with_rescaling(RescalingScheme::Always)
            .with_max_underflow_retries(3);
        assert_eq!(config.lane_count, 4);
        assert_eq!(config.max_underflow_retries, 3);
        assert!(PrefetchConfig::default().with_lane_count(0).validate().is_err());
        assert!(PrefetchConfig::default()
            .with_rescale_threshold(f64::NAN)
            .validate()
            .is_err());
    }
}

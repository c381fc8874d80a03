//! Autoencoder relevance gate.
//!
//! The detector is trained to reconstruct photos of the expected subject.
//! Anything it reconstructs poorly is treated as off-distribution and never
//! reaches the classifiers.

use crate::error::Result;
use crate::models::registry::ModelHandle;
use crate::preprocess::ImageTensor;
use crate::types::report::RelevanceVerdict;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tight threshold, used end to end by default.
pub const STRICT_THRESHOLD: f64 = 0.005;
/// Looser threshold that lets through noisier photos.
pub const SMOOTH_THRESHOLD: f64 = 0.0075;

/// Named reconstruction-error threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdProfile {
    #[default]
    Strict,
    Smooth,
}

impl ThresholdProfile {
    pub fn threshold(self) -> f64 {
        match self {
            ThresholdProfile::Strict => STRICT_THRESHOLD,
            ThresholdProfile::Smooth => SMOOTH_THRESHOLD,
        }
    }
}

/// Accepts an image iff its reconstruction error is strictly below the
/// threshold.
#[derive(Debug, Clone, Copy)]
pub struct RelevanceGate {
    threshold: f64,
}

impl RelevanceGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score `image` (0-1 scaled) against the detector. Without a detector the
    /// gate accepts everything.
    pub fn check(
        &self,
        image: &ImageTensor,
        detector: Option<&ModelHandle>,
    ) -> Result<RelevanceVerdict> {
        let Some(detector) = detector else {
            return Ok(RelevanceVerdict::skipped(self.threshold));
        };

        let (reconstruction, elapsed) = detector.infer(image)?;
        let error = image.mean_squared_error(&reconstruction)?;
        let verdict = RelevanceVerdict::measured(error, self.threshold);

        debug!(
            reconstruction_error = error,
            threshold = self.threshold,
            accepted = verdict.accepted,
            elapsed_us = elapsed.as_micros() as u64,
            "Relevance check complete"
        );

        Ok(verdict)
    }
}

impl Default for RelevanceGate {
    fn default() -> Self {
        Self::new(STRICT_THRESHOLD)
    }
}

//! Weighted soft-voting over classifier outputs

use crate::error::{PipelineError, Result};
use crate::models::registry::ModelHandle;
use crate::preprocess::ImageTensor;
use crate::types::family::{DiseaseFamily, Taxonomy};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Floor for the weight denominator.
pub const MIN_WEIGHT_SUM: f64 = 1e-6;

/// Fused decision of one ensemble run
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    /// Winning class name
    pub label: String,
    /// Fused probability of the winning class (0.0 - 1.0)
    pub confidence: f64,
    /// Fused distribution, aligned with `taxonomy`
    pub probabilities: Vec<f64>,
    /// Output taxonomy (binary when the input taxonomy collapsed)
    pub taxonomy: Taxonomy,
    /// Normalized distribution of each contributing model
    pub model_probabilities: BTreeMap<String, Vec<f64>>,
    /// Sum of the weights that actually contributed
    pub contributing_weight: f64,
    /// Time spent inside each model that ran
    pub model_times: BTreeMap<String, Duration>,
}

/// Fold a 4-way vector into `[v0 + v1, v2 + v3]`.
pub fn collapse_pairs(raw: &[f64]) -> Vec<f64> {
    raw.chunks(2).map(|pair| pair.iter().sum()).collect()
}

/// Scale `values` to sum to one. `None` when the sum is zero or not finite.
pub fn l1_normalize(values: &[f64]) -> Option<Vec<f64>> {
    let sum: f64 = values.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return None;
    }
    Some(values.iter().map(|v| v / sum).collect())
}

/// Index and value of the maximum; the lowest index wins ties.
pub fn argmax(values: &[f64]) -> Option<(usize, f64)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, value)| match best {
            Some((_, best_value)) if value <= best_value => best,
            _ => Some((index, value)),
        })
}

/// Combines classifier outputs for one disease family.
#[derive(Debug, Clone)]
pub struct EnsembleVoter {
    family: DiseaseFamily,
    /// Model weights; missing entries weigh zero
    weights: BTreeMap<String, f64>,
    /// Taxonomy the classifiers were trained on
    taxonomy: Taxonomy,
}

impl EnsembleVoter {
    pub fn new(family: DiseaseFamily, weights: BTreeMap<String, f64>, taxonomy: Taxonomy) -> Self {
        Self {
            family,
            weights,
            taxonomy,
        }
    }

    pub fn weight(&self, model: &str) -> f64 {
        self.weights.get(model).copied().unwrap_or(0.0)
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Run every positively weighted handle on `image` and fuse the results.
    ///
    /// The first failing model aborts the vote; a partial ensemble is never
    /// averaged.
    pub fn vote(&self, image: &ImageTensor, handles: &BTreeMap<String, ModelHandle>) -> Result<Vote> {
        if handles.is_empty() {
            return Err(PipelineError::ModelsUnavailable {
                family: self.family,
            });
        }

        let mut outputs = Vec::with_capacity(handles.len());
        let mut model_times = BTreeMap::new();

        for (name, handle) in handles {
            if self.weight(name) <= 0.0 {
                debug!(model = %name, "Skipping model without weight");
                continue;
            }

            let (output, elapsed) = handle.infer(image)?;
            model_times.insert(name.clone(), elapsed);
            outputs.push((name.as_str(), output));
        }

        let mut vote = self.fuse(outputs.iter().map(|(name, output)| (*name, output.as_slice())))?;
        vote.model_times = model_times;
        Ok(vote)
    }

    /// Fuse raw model outputs in the order given.
    pub fn fuse<'a, I>(&self, outputs: I) -> Result<Vote>
    where
        I: IntoIterator<Item = (&'a str, &'a [f32])>,
    {
        let taxonomy = self.taxonomy.output();
        let mut total = vec![0.0; taxonomy.len()];
        let mut contributing_weight = 0.0;
        let mut model_probabilities = BTreeMap::new();

        for (name, raw) in outputs {
            let weight = self.weight(name);
            if weight <= 0.0 {
                continue;
            }

            if raw.len() != self.taxonomy.len() {
                return Err(PipelineError::inference(
                    name,
                    format!(
                        "expected {} class scores, got {}",
                        self.taxonomy.len(),
                        raw.len()
                    ),
                ));
            }

            if let Some(bad) = raw.iter().find(|p| !p.is_finite() || **p < 0.0) {
                return Err(PipelineError::inference(
                    name,
                    format!("class score {} is not a probability", bad),
                ));
            }

            let raw: Vec<f64> = raw.iter().map(|&p| p as f64).collect();
            let grouped = if self.taxonomy.collapses() {
                collapse_pairs(&raw)
            } else {
                raw
            };

            let Some(normalized) = l1_normalize(&grouped) else {
                warn!(model = %name, output = ?grouped, "Model output sums to zero, ignoring it");
                continue;
            };

            for (acc, p) in total.iter_mut().zip(&normalized) {
                *acc += p * weight;
            }
            contributing_weight += weight;
            model_probabilities.insert(name.to_string(), normalized);
        }

        if contributing_weight == 0.0 {
            warn!(family = %self.family, "No weighted model contributed to the vote");
        }

        let denominator = contributing_weight.max(MIN_WEIGHT_SUM);
        let probabilities: Vec<f64> = total.iter().map(|p| p / denominator).collect();

        let (index, confidence) = argmax(&probabilities).unwrap_or((0, 0.0));
        let label = taxonomy.name(index).unwrap_or_default().to_string();

        debug!(
            family = %self.family,
            label = %label,
            confidence = confidence,
            probabilities = ?probabilities,
            "Ensemble vote complete"
        );

        Ok(Vote {
            label,
            confidence,
            probabilities,
            taxonomy,
            model_probabilities,
            contributing_weight,
            model_times: BTreeMap::new(),
        })
    }
}

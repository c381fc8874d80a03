//! Per-request prediction pipeline.
//!
//! A request moves strictly forward through
//! `Received -> Preprocessed -> Gated -> Voted`, stopping early at the gate
//! when the image is rejected, or at any stage on error.

use crate::config::AppConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::models::ensemble::{EnsembleVoter, Vote};
use crate::models::registry::ModelRegistry;
use crate::models::relevance::RelevanceGate;
use crate::preprocess::{ImagePreprocessor, PixelScale};
use crate::types::family::DiseaseFamily;
use crate::types::report::{Outcome, PredictionResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Stage a request last reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Preprocessed,
    Gated,
    Voted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Preprocessed => "preprocessed",
            Stage::Gated => "gated",
            Stage::Voted => "voted",
        };
        f.write_str(name)
    }
}

/// Static per-family plan resolved from configuration at startup
#[derive(Debug, Clone)]
struct FamilyPlan {
    voter: EnsembleVoter,
    pixel_scale: PixelScale,
}

/// Relevance-gated ensemble pipeline over a shared model registry
pub struct PredictionPipeline {
    registry: Arc<ModelRegistry>,
    preprocessor: ImagePreprocessor,
    gate: RelevanceGate,
    plans: BTreeMap<DiseaseFamily, FamilyPlan>,
    metrics: Arc<PipelineMetrics>,
}

impl PredictionPipeline {
    /// Create a pipeline from validated configuration and a loaded registry
    pub fn new(config: &AppConfig, registry: Arc<ModelRegistry>) -> Self {
        let plans = config
            .families
            .iter()
            .map(|(family, family_config)| {
                let plan = FamilyPlan {
                    voter: EnsembleVoter::new(
                        family,
                        family_config.weights.clone(),
                        family_config.taxonomy.clone(),
                    ),
                    pixel_scale: family_config.pixel_scale,
                };
                (family, plan)
            })
            .collect();

        let gate = RelevanceGate::new(config.relevance.threshold());

        info!(
            threshold = gate.threshold(),
            detector = registry.detector().is_some(),
            "Prediction pipeline initialized"
        );

        Self {
            registry,
            preprocessor: ImagePreprocessor::new(),
            gate,
            plans,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Screen one uploaded image for `family`.
    ///
    /// Gate rejection is a successful [`Outcome::Rejected`]; decode failures,
    /// missing models and inference failures are errors.
    pub fn predict(&self, image_bytes: &[u8], family: DiseaseFamily) -> Result<Outcome> {
        let start_time = Instant::now();
        let mut stage = Stage::Received;

        let result = self.run(image_bytes, family, &mut stage);
        let elapsed = start_time.elapsed();

        match &result {
            Ok(outcome) => self.metrics.record_outcome(outcome, elapsed),
            Err(e) => {
                self.metrics.record_failure(elapsed);
                error!(
                    family = %family,
                    stage = %stage,
                    error = %e,
                    "Prediction failed"
                );
            }
        }

        result
    }

    fn run(&self, image_bytes: &[u8], family: DiseaseFamily, stage: &mut Stage) -> Result<Outcome> {
        let image = self.preprocessor.prepare(image_bytes)?;
        *stage = Stage::Preprocessed;
        let (width, height) = image.original_dimensions();
        debug!(family = %family, width, height, "Image decoded");

        let verdict = self
            .gate
            .check(&image.tensor(PixelScale::Unit)?, self.registry.detector())?;
        self.metrics.record_relevance(&verdict);
        *stage = Stage::Gated;

        if !verdict.accepted {
            info!(
                family = %family,
                reconstruction_error = verdict.reconstruction_error,
                threshold = verdict.threshold,
                "Image rejected by relevance gate"
            );
            return Ok(Outcome::Rejected(verdict));
        }

        let plan = self
            .plans
            .get(&family)
            .ok_or(PipelineError::ModelsUnavailable { family })?;
        let handles = self.registry.classifiers(family)?;

        let tensor = image.tensor(plan.pixel_scale)?;
        let vote = plan.voter.vote(&tensor, handles)?;
        *stage = Stage::Voted;

        for (model, elapsed) in &vote.model_times {
            self.metrics
                .record_model_time(&format!("{}/{}", family.code(), model), *elapsed);
        }
        if vote.contributing_weight == 0.0 {
            warn!(family = %family, "Vote produced without any weighted model");
        }

        let result = prediction_result(family, vote);
        debug!(
            family = %family,
            label = %result.label,
            confidence = result.confidence,
            "Prediction complete"
        );

        Ok(Outcome::Diagnosed(result))
    }
}

fn prediction_result(family: DiseaseFamily, vote: Vote) -> PredictionResult {
    PredictionResult {
        family,
        label: vote.label,
        confidence: vote.confidence * 100.0,
        probabilities: vote.probabilities,
        classes: vote.taxonomy.classes().to_vec(),
        model_probabilities: vote.model_probabilities,
        abstained: vote.contributing_weight == 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::{png_bytes, ConstantReconstruction, FixedOutput, Identity};
    use crate::types::family::{DISEASED, HEALTHY};
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.families.get_mut(DiseaseFamily::Lsd).weights =
            BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 1.0)]);
        config.families.get_mut(DiseaseFamily::Fmd).weights =
            BTreeMap::from([("a".to_string(), 1.0)]);
        config
    }

    fn black_png() -> Vec<u8> {
        png_bytes(64, 48, [0, 0, 0])
    }

    #[test]
    fn test_binary_family_diagnosis() {
        let registry = ModelRegistry::new()
            .with_detector(Box::new(Identity))
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(FixedOutput::new(vec![0.9, 0.1])))
            .with_classifier(DiseaseFamily::Lsd, "b", Box::new(FixedOutput::new(vec![0.3, 0.7])));
        let pipeline = PredictionPipeline::new(&config(), Arc::new(registry));

        let outcome = pipeline.predict(&black_png(), DiseaseFamily::Lsd).unwrap();

        let Outcome::Diagnosed(result) = outcome else {
            panic!("expected a diagnosis, got {:?}", outcome);
        };
        assert_eq!(result.label, DISEASED);
        assert_abs_diff_eq!(result.confidence, 60.0, epsilon = 1e-4);
        assert_eq!(result.confidence_rounded(), 60.0);
        assert_eq!(result.disease_status(), "LSD Infected");
        assert_eq!(result.model_probabilities.len(), 2);
    }

    #[test]
    fn test_four_way_family_diagnosis() {
        let registry = ModelRegistry::new().with_classifier(
            DiseaseFamily::Fmd,
            "a",
            Box::new(FixedOutput::new(vec![0.1, 0.1, 0.4, 0.4])),
        );
        let pipeline = PredictionPipeline::new(&config(), Arc::new(registry));

        let outcome = pipeline.predict(&black_png(), DiseaseFamily::Fmd).unwrap();

        let Outcome::Diagnosed(result) = outcome else {
            panic!("expected a diagnosis, got {:?}", outcome);
        };
        assert_eq!(result.classes, vec![DISEASED.to_string(), HEALTHY.to_string()]);
        assert_eq!(result.label, HEALTHY);
        assert_abs_diff_eq!(result.confidence, 80.0, epsilon = 1e-4);
        assert_eq!(result.disease_status(), "Healthy");
    }

    #[test]
    fn test_rejected_image_never_reaches_ensemble() {
        let classifier = FixedOutput::new(vec![0.9, 0.1]);
        let calls = classifier.calls();
        let registry = ModelRegistry::new()
            .with_detector(Box::new(ConstantReconstruction(0.5)))
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(classifier));
        let pipeline = PredictionPipeline::new(&config(), Arc::new(registry));

        let outcome = pipeline.predict(&black_png(), DiseaseFamily::Lsd).unwrap();

        let Outcome::Rejected(verdict) = outcome else {
            panic!("expected a rejection, got {:?}", outcome);
        };
        assert!(!verdict.accepted);
        assert_eq!(verdict.reconstruction_error, 0.25);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.metrics().requests_rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_no_models_for_family() {
        let registry = ModelRegistry::new()
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(FixedOutput::new(vec![0.9, 0.1])));
        let pipeline = PredictionPipeline::new(&config(), Arc::new(registry));

        let err = pipeline.predict(&black_png(), DiseaseFamily::Fmd).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ModelsUnavailable { family: DiseaseFamily::Fmd }
        ));
        assert_eq!(pipeline.metrics().requests_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_inference_failure_fails_request() {
        let registry = ModelRegistry::new()
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(FixedOutput::new(vec![0.9, 0.1])))
            .with_classifier(DiseaseFamily::Lsd, "b", Box::new(FixedOutput::failing()));
        let pipeline = PredictionPipeline::new(&config(), Arc::new(registry));

        let err = pipeline.predict(&black_png(), DiseaseFamily::Lsd).unwrap_err();
        assert!(err.is_inference());
    }

    #[test]
    fn test_undecodable_upload_runs_no_model() {
        let detector = FixedOutput::new(vec![]);
        let detector_calls = detector.calls();
        let registry = ModelRegistry::new()
            .with_detector(Box::new(detector))
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(FixedOutput::new(vec![0.9, 0.1])));
        let pipeline = PredictionPipeline::new(&config(), Arc::new(registry));

        let err = pipeline.predict(b"GIF89a nope", DiseaseFamily::Lsd).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(detector_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_repeat_predictions_are_identical() {
        let registry = ModelRegistry::new()
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(FixedOutput::new(vec![0.61, 0.39])))
            .with_classifier(DiseaseFamily::Lsd, "b", Box::new(FixedOutput::new(vec![0.2, 0.8])));
        let pipeline = PredictionPipeline::new(&config(), Arc::new(registry));
        let bytes = black_png();

        let first = pipeline.predict(&bytes, DiseaseFamily::Lsd).unwrap();
        let second = pipeline.predict(&bytes, DiseaseFamily::Lsd).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_vote_without_weighted_models_is_undetermined() {
        let mut config = config();
        config.families.get_mut(DiseaseFamily::Lsd).weights =
            BTreeMap::from([("a".to_string(), 0.0)]);
        let registry = ModelRegistry::new()
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(FixedOutput::new(vec![0.9, 0.1])));
        let pipeline = PredictionPipeline::new(&config, Arc::new(registry));

        let outcome = pipeline.predict(&black_png(), DiseaseFamily::Lsd).unwrap();

        let Outcome::Diagnosed(result) = outcome else {
            panic!("expected a diagnosis, got {:?}", outcome);
        };
        assert!(result.abstained);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.disease_status(), "Undetermined");
    }

    #[test]
    fn test_concurrent_requests_share_one_pipeline() {
        const THREADS: usize = 8;
        const REQUESTS: usize = 5;

        let a = FixedOutput::new(vec![0.9, 0.1]);
        let b = FixedOutput::new(vec![0.3, 0.7]);
        let (a_calls, b_calls) = (a.calls(), b.calls());
        let registry = ModelRegistry::new()
            .with_detector(Box::new(Identity))
            .with_classifier(DiseaseFamily::Lsd, "a", Box::new(a))
            .with_classifier(DiseaseFamily::Lsd, "b", Box::new(b));
        let pipeline = Arc::new(PredictionPipeline::new(&config(), Arc::new(registry)));
        let bytes = black_png();
        let expected = pipeline.predict(&bytes, DiseaseFamily::Lsd).unwrap();

        let outcomes: Vec<Outcome> = thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let pipeline = Arc::clone(&pipeline);
                    let bytes = &bytes;
                    scope.spawn(move || {
                        (0..REQUESTS)
                            .map(|_| pipeline.predict(bytes, DiseaseFamily::Lsd).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        let total = THREADS * REQUESTS;
        assert_eq!(outcomes.len(), total);
        assert!(outcomes.iter().all(|outcome| *outcome == expected));
        assert_eq!(a_calls.load(Ordering::SeqCst), total + 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), total + 1);
        assert_eq!(
            pipeline.metrics().requests_processed.load(Ordering::Relaxed),
            total as u64 + 1
        );
    }
}

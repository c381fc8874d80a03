//! Performance metrics and statistics tracking for the screening pipeline.

use crate::models::ensemble::argmax;
use crate::types::report::{Outcome, RelevanceVerdict, UNDETERMINED};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for pipeline performance
pub struct PipelineMetrics {
    /// Total requests that reached a terminal state
    pub requests_processed: AtomicU64,
    /// Requests rejected by the relevance gate
    pub requests_rejected: AtomicU64,
    /// Requests that ended in an error
    pub requests_failed: AtomicU64,
    /// Diagnoses by label
    diagnoses_by_label: RwLock<BTreeMap<String, u64>>,
    /// Processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Model inference times (in microseconds)
    model_times: RwLock<BTreeMap<String, Vec<u64>>>,
    /// Confidence distribution buckets (tenths of 100%)
    confidence_buckets: RwLock<[u64; 10]>,
    /// Reconstruction errors of gated images
    reconstruction_errors: RwLock<Vec<f64>>,
    /// Start time for rate calculation
    start_time: Instant,
    /// Fraction of models agreeing with the fused label, per diagnosis
    model_agreements: RwLock<Vec<f64>>,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            requests_processed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            diagnoses_by_label: RwLock::new(BTreeMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            model_times: RwLock::new(BTreeMap::new()),
            confidence_buckets: RwLock::new([0; 10]),
            reconstruction_errors: RwLock::new(Vec::with_capacity(1000)),
            start_time: Instant::now(),
            model_agreements: RwLock::new(Vec::with_capacity(1000)),
        }
    }

    /// Record a request that finished with an outcome
    pub fn record_outcome(&self, outcome: &Outcome, processing_time: Duration) {
        self.record_processing_time(processing_time);

        match outcome {
            Outcome::Diagnosed(result) => {
                let label = if result.abstained {
                    UNDETERMINED.to_string()
                } else {
                    result.label.clone()
                };
                if let Ok(mut by_label) = self.diagnoses_by_label.write() {
                    *by_label.entry(label).or_insert(0) += 1;
                }

                let bucket = (result.confidence / 10.0).clamp(0.0, 9.0) as usize;
                if let Ok(mut buckets) = self.confidence_buckets.write() {
                    buckets[bucket] += 1;
                }

                if let Some(index) = result.classes.iter().position(|c| *c == result.label) {
                    self.record_model_agreement(&result.model_probabilities, index);
                }
            }
            Outcome::Rejected(_) => {
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a request that ended in an error
    pub fn record_failure(&self, processing_time: Duration) {
        self.record_processing_time(processing_time);
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processing_time(&self, processing_time: Duration) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }
    }

    /// Record a relevance verdict that came from a real detector run
    pub fn record_relevance(&self, verdict: &RelevanceVerdict) {
        if verdict.skipped {
            return;
        }
        if let Ok(mut errors) = self.reconstruction_errors.write() {
            errors.push(verdict.reconstruction_error);
            if errors.len() > 1000 {
                errors.drain(0..500);
            }
        }
    }

    /// Record model inference time
    pub fn record_model_time(&self, model_name: &str, duration: Duration) {
        if let Ok(mut times) = self.model_times.write() {
            let model_times = times.entry(model_name.to_string()).or_default();
            model_times.push(duration.as_micros() as u64);
            // Keep only last 1000 per model
            if model_times.len() > 1000 {
                model_times.drain(0..500);
            }
        }
    }

    /// Record how many models individually picked the fused class
    pub fn record_model_agreement(
        &self,
        model_probabilities: &BTreeMap<String, Vec<f64>>,
        fused_index: usize,
    ) {
        if model_probabilities.len() < 2 {
            return;
        }

        let agreeing = model_probabilities
            .values()
            .filter(|probs| argmax(probs).map(|(i, _)| i) == Some(fused_index))
            .count();
        let agreement = agreeing as f64 / model_probabilities.len() as f64;

        if let Ok(mut agreements) = self.model_agreements.write() {
            agreements.push(agreement);
            if agreements.len() > 1000 {
                agreements.drain(0..500);
            }
        }
    }

    /// Snapshot of everything recorded so far
    pub fn summary(&self) -> ScreeningSummary {
        let processed = self.requests_processed.load(Ordering::Relaxed);
        let rejected = self.requests_rejected.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);

        let latency = self
            .processing_times
            .read()
            .map(|times| LatencyStats::from_samples(&times))
            .unwrap_or_default();

        let model_latency = self
            .model_times
            .read()
            .map(|times| {
                times
                    .iter()
                    .filter(|(_, samples)| !samples.is_empty())
                    .map(|(model, samples)| (model.clone(), LatencyStats::from_samples(samples)))
                    .collect()
            })
            .unwrap_or_default();

        let elapsed = self.start_time.elapsed().as_secs_f64();

        ScreeningSummary {
            processed,
            diagnosed: processed.saturating_sub(rejected + failed),
            rejected,
            failed,
            diagnoses_by_label: self
                .diagnoses_by_label
                .read()
                .map(|by_label| by_label.clone())
                .unwrap_or_default(),
            confidence_buckets: self
                .confidence_buckets
                .read()
                .map(|buckets| *buckets)
                .unwrap_or_default(),
            avg_reconstruction_error: average(&self.reconstruction_errors),
            avg_agreement: average(&self.model_agreements),
            latency,
            model_latency,
            throughput: if elapsed > 0.0 { processed as f64 / elapsed } else { 0.0 },
        }
    }

    /// Log the end-of-run summary
    pub fn print_summary(&self) {
        let summary = self.summary();

        info!(
            processed = summary.processed,
            diagnosed = summary.diagnosed,
            rejected = summary.rejected,
            failed = summary.failed,
            rejection_rate = format!("{:.1}%", summary.rejection_rate() * 100.0),
            throughput = format!("{:.2} img/s", summary.throughput),
            "Screening summary"
        );
        info!(
            mean_us = summary.latency.mean_us,
            p50_us = summary.latency.p50_us,
            p95_us = summary.latency.p95_us,
            max_us = summary.latency.max_us,
            "Request latency"
        );
        info!(
            avg_reconstruction_error = format!("{:.5}", summary.avg_reconstruction_error),
            model_agreement = format!("{:.1}%", summary.avg_agreement * 100.0),
            "Gate and ensemble health"
        );

        for (label, count) in &summary.diagnoses_by_label {
            info!(
                label = %label,
                count,
                share = format!("{:.1}%", summary.label_share(label) * 100.0),
                "Diagnoses"
            );
        }
        if summary.diagnosed > 0 {
            info!(buckets = ?summary.confidence_buckets, "Confidence distribution (10% buckets)");
        }

        for (model, stats) in &summary.model_latency {
            info!(
                model = %model,
                calls = stats.samples,
                mean_us = stats.mean_us,
                p95_us = stats.p95_us,
                "Model latency"
            );
        }
    }
}

fn average(values: &RwLock<Vec<f64>>) -> f64 {
    match values.read() {
        Ok(values) if !values.is_empty() => values.iter().sum::<f64>() / values.len() as f64,
        _ => 0.0,
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency percentiles over recorded samples, in microseconds
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub samples: usize,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub max_us: u64,
}

impl LatencyStats {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        // Nearest-rank percentile
        let rank = |q: f64| sorted[((q * count as f64).ceil() as usize).clamp(1, count) - 1];

        Self {
            samples: count,
            mean_us: sorted.iter().sum::<u64>() / count as u64,
            p50_us: rank(0.50),
            p95_us: rank(0.95),
            max_us: sorted[count - 1],
        }
    }
}

/// Point-in-time view of a screening run
#[derive(Debug, Clone, Default)]
pub struct ScreeningSummary {
    pub processed: u64,
    pub diagnosed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub diagnoses_by_label: BTreeMap<String, u64>,
    /// Diagnoses per 10% confidence band
    pub confidence_buckets: [u64; 10],
    /// Mean reconstruction error over images the detector actually scored
    pub avg_reconstruction_error: f64,
    /// Mean fraction of models whose own argmax matched the fused label
    pub avg_agreement: f64,
    pub latency: LatencyStats,
    /// Keyed by `<FAMILY>/<model id>`
    pub model_latency: BTreeMap<String, LatencyStats>,
    /// Images per second since the collector was created
    pub throughput: f64,
}

impl ScreeningSummary {
    /// Fraction of processed images the relevance gate turned away.
    pub fn rejection_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.rejected as f64 / self.processed as f64
        }
    }

    /// Fraction of diagnoses that carried `label`.
    pub fn label_share(&self, label: &str) -> f64 {
        match self.diagnoses_by_label.get(label) {
            Some(&count) if self.diagnosed > 0 => count as f64 / self.diagnosed as f64,
            _ => 0.0,
        }
    }
}

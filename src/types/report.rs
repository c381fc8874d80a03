//! Prediction outcomes and the per-image screening report

use crate::error::PipelineError;
use crate::types::family::{DiseaseFamily, DISEASED};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// User-facing warning attached to gate rejections.
pub const LOW_RELEVANCE_WARNING: &str =
    "Irrelevant or low-quality image detected. Try a clearer image.";

/// Status shown when no model contributed to a vote.
pub const UNDETERMINED: &str = "Undetermined";

/// Attached to diagnoses no model contributed to.
pub const NO_VOTE_WARNING: &str =
    "No weighted model produced a usable output, the label is not a diagnosis.";

/// Outcome of the relevance gate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    /// Mean squared reconstruction error
    pub reconstruction_error: f64,
    /// Threshold the error was compared against
    pub threshold: f64,
    /// Whether the image passed the gate
    pub accepted: bool,
    /// True when no detector was loaded and the gate was bypassed
    pub skipped: bool,
}

impl RelevanceVerdict {
    /// Verdict for an image whose error was measured.
    pub fn measured(reconstruction_error: f64, threshold: f64) -> Self {
        Self {
            reconstruction_error,
            threshold,
            accepted: reconstruction_error < threshold,
            skipped: false,
        }
    }

    /// Verdict used when no detector is available.
    pub fn skipped(threshold: f64) -> Self {
        Self {
            reconstruction_error: 0.0,
            threshold,
            accepted: true,
            skipped: true,
        }
    }
}

/// Fused ensemble decision for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub family: DiseaseFamily,
    /// Winning class of the output taxonomy
    pub label: String,
    /// Confidence in percent (0.0 - 100.0)
    pub confidence: f64,
    /// Fused distribution over the output taxonomy
    pub probabilities: Vec<f64>,
    /// Output taxonomy class names, aligned with `probabilities`
    pub classes: Vec<String>,
    /// Normalized distribution of each contributing model
    pub model_probabilities: BTreeMap<String, Vec<f64>>,
    /// No model contributed; `label` is the placeholder first class
    #[serde(default)]
    pub abstained: bool,
}

impl PredictionResult {
    /// Confidence rounded to two decimals for display.
    pub fn confidence_rounded(&self) -> f64 {
        (self.confidence * 100.0).round() / 100.0
    }

    pub fn is_diseased(&self) -> bool {
        !self.abstained && self.label == DISEASED
    }

    /// Human readable status, e.g. "FMD Infected" or "Healthy".
    pub fn disease_status(&self) -> String {
        if self.abstained {
            UNDETERMINED.to_string()
        } else if self.is_diseased() {
            format!("{} Infected", self.family.code())
        } else {
            "Healthy".to_string()
        }
    }
}

/// Terminal state of a successful pipeline run
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Image passed the gate and the ensemble voted
    Diagnosed(PredictionResult),
    /// Image failed the relevance gate; the ensemble never ran
    Rejected(RelevanceVerdict),
}

/// Report status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Diagnosed,
    Rejected,
    Failed,
}

/// One line of batch output describing what happened to an input image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningReport {
    /// Unique report identifier
    pub report_id: String,

    /// Report generation timestamp
    pub timestamp: DateTime<Utc>,

    /// Where the image came from (file name)
    pub source: String,

    pub family: DiseaseFamily,

    pub status: ReportStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Confidence in percent, rounded to two decimals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disease_status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<RelevanceVerdict>,

    /// Warning or error text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ScreeningReport {
    fn new(source: String, family: DiseaseFamily, status: ReportStatus) -> Self {
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
            family,
            status,
            label: None,
            confidence: None,
            disease_status: None,
            relevance: None,
            message: None,
        }
    }

    /// Build a report from a pipeline outcome.
    pub fn from_outcome(source: String, family: DiseaseFamily, outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Diagnosed(result) => {
                let mut report = Self::new(source, family, ReportStatus::Diagnosed);
                report.label = Some(result.label.clone());
                report.confidence = Some(result.confidence_rounded());
                report.disease_status = Some(result.disease_status());
                if result.abstained {
                    report.message = Some(NO_VOTE_WARNING.to_string());
                }
                report
            }
            Outcome::Rejected(verdict) => {
                let mut report = Self::new(source, family, ReportStatus::Rejected);
                report.relevance = Some(*verdict);
                report.message = Some(LOW_RELEVANCE_WARNING.to_string());
                report
            }
        }
    }

    /// Build a report for a request that ended in an error.
    pub fn from_error(source: String, family: DiseaseFamily, error: &PipelineError) -> Self {
        Self::failed(source, family, error.to_string())
    }

    /// Build a failure report from free-form text.
    pub fn failed(source: String, family: DiseaseFamily, message: String) -> Self {
        let mut report = Self::new(source, family, ReportStatus::Failed);
        report.message = Some(message);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::family::HEALTHY;

    fn result(label: &str, confidence: f64) -> PredictionResult {
        PredictionResult {
            family: DiseaseFamily::Fmd,
            label: label.to_string(),
            confidence,
            probabilities: vec![confidence / 100.0, 1.0 - confidence / 100.0],
            classes: vec![DISEASED.to_string(), HEALTHY.to_string()],
            model_probabilities: BTreeMap::new(),
            abstained: false,
        }
    }

    #[test]
    fn test_verdict_threshold_is_strict() {
        assert!(RelevanceVerdict::measured(0.004, 0.005).accepted);
        assert!(!RelevanceVerdict::measured(0.005, 0.005).accepted);
        assert!(!RelevanceVerdict::measured(f64::NAN, 0.005).accepted);
        assert!(RelevanceVerdict::skipped(0.005).accepted);
    }

    #[test]
    fn test_disease_status() {
        assert_eq!(result(DISEASED, 91.2).disease_status(), "FMD Infected");
        assert_eq!(result(HEALTHY, 70.0).disease_status(), "Healthy");
    }

    #[test]
    fn test_confidence_rounding() {
        assert_eq!(result(DISEASED, 66.66666).confidence_rounded(), 66.67);
    }

    #[test]
    fn test_report_serialization() {
        let outcome = Outcome::Diagnosed(result(DISEASED, 80.0));
        let report = ScreeningReport::from_outcome("cow.jpg".to_string(), DiseaseFamily::Fmd, &outcome);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"diagnosed\""));
        assert!(!json.contains("relevance"));

        let deserialized: ScreeningReport = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.label.as_deref(), Some(DISEASED));
        assert_eq!(deserialized.confidence, Some(80.0));
    }

    #[test]
    fn test_rejected_report_carries_verdict() {
        let outcome = Outcome::Rejected(RelevanceVerdict::measured(0.02, 0.005));
        let report = ScreeningReport::from_outcome("car.png".to_string(), DiseaseFamily::Lsd, &outcome);

        assert_eq!(report.status, ReportStatus::Rejected);
        assert_eq!(report.label, None);
        assert_eq!(report.message.as_deref(), Some(LOW_RELEVANCE_WARNING));
        assert_eq!(report.relevance.map(|v| v.accepted), Some(false));
    }

    #[test]
    fn test_abstained_vote_is_not_an_infection() {
        let mut abstained = result(DISEASED, 0.0);
        abstained.abstained = true;

        assert!(!abstained.is_diseased());
        assert_eq!(abstained.disease_status(), "Undetermined");

        let report = ScreeningReport::from_outcome(
            "cow.jpg".to_string(),
            DiseaseFamily::Fmd,
            &Outcome::Diagnosed(abstained),
        );
        assert_eq!(report.disease_status.as_deref(), Some("Undetermined"));
        assert_eq!(report.message.as_deref(), Some(NO_VOTE_WARNING));
    }
}

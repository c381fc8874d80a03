//! Type definitions for the screening pipeline

pub mod family;
pub mod report;

pub use family::{DiseaseFamily, Taxonomy};
pub use report::{Outcome, PredictionResult, RelevanceVerdict, ScreeningReport};

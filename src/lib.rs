//! Cattle Disease Screening Library
//!
//! Relevance-gated ensemble screening of cattle photographs for
//! foot-and-mouth disease (FMD) and lumpy skin disease (LSD).

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod preprocess;
pub mod types;

pub use config::AppConfig;
pub use error::PipelineError;
pub use models::{ModelLoader, ModelRegistry};
pub use pipeline::PredictionPipeline;
pub use types::{DiseaseFamily, Outcome, PredictionResult, ScreeningReport};

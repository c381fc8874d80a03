//! Request-time error types for the screening pipeline.
//!
//! Load-time problems (a missing or broken model artifact) never surface here:
//! the registry records them as omissions and keeps going. Everything in this
//! module aborts the single request it occurred in.

use crate::types::family::DiseaseFamily;
use thiserror::Error;

/// Boxed cause carried by inference failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that terminate one prediction request.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Uploaded bytes are not a decodable image
    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),

    /// No usable classifier is loaded for the requested family
    #[error("no models available for {family} inference, check model paths")]
    ModelsUnavailable { family: DiseaseFamily },

    /// A model invocation failed; the whole ensemble is abandoned
    #[error("inference error in model {model}: {source}")]
    Inference {
        model: String,
        #[source]
        source: BoxError,
    },

    /// Tensor shape did not match the fixed model input shape
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Disease family selector did not name a known family
    #[error("unknown disease family: {0:?}")]
    UnknownFamily(String),
}

impl PipelineError {
    /// Wrap a failure raised while running `model`.
    pub fn inference(model: &str, source: impl Into<BoxError>) -> Self {
        PipelineError::Inference {
            model: model.to_string(),
            source: source.into(),
        }
    }

    /// Whether this error came out of a model call (as opposed to bad input
    /// or missing models).
    pub fn is_inference(&self) -> bool {
        matches!(
            self,
            PipelineError::Inference { .. } | PipelineError::Shape { .. }
        )
    }
}

/// Result alias for request-path operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

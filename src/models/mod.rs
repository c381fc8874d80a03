//! Model loading, relevance gating and ensemble voting

pub mod ensemble;
pub mod loader;
pub mod registry;
pub mod relevance;

pub use ensemble::{EnsembleVoter, Vote};
pub use loader::{InferenceModel, ModelLoader, ModelSource};
pub use registry::{ModelHandle, ModelRegistry, Omission, OmissionReason};
pub use relevance::{RelevanceGate, ThresholdProfile};

//! Process-wide registry of loaded model handles.
//!
//! The registry is built once at startup from the configuration and then
//! shared (behind an `Arc`) by every request. Artifacts that cannot be loaded
//! are skipped and recorded as [`Omission`]s; only a family with no usable
//! classifier at all is an error, and only when a request asks for it.

use crate::config::AppConfig;
use crate::error::{PipelineError, Result};
use crate::models::loader::{InferenceModel, ModelSource};
use crate::preprocess::ImageTensor;
use crate::types::family::DiseaseFamily;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A named model behind its own lock.
///
/// The lock is held for exactly one inference call.
pub struct ModelHandle {
    name: String,
    model: Mutex<Box<dyn InferenceModel>>,
}

impl ModelHandle {
    pub fn new(name: impl Into<String>, model: Box<dyn InferenceModel>) -> Self {
        Self {
            name: name.into(),
            model: Mutex::new(model),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the model once, returning its flat output and the time spent
    /// inside the model (lock wait excluded).
    pub fn infer(&self, input: &ImageTensor) -> Result<(Vec<f32>, Duration)> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| PipelineError::inference(&self.name, "model lock poisoned"))?;

        let start = Instant::now();
        let output = model
            .run(input)
            .map_err(|e| PipelineError::inference(&self.name, e))?;
        Ok((output, start.elapsed()))
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle").field("name", &self.name).finish()
    }
}

/// Why an artifact was left out of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OmissionReason {
    /// Path does not exist
    Missing,
    /// File is not in the loader's artifact format
    WrongFormat,
    /// The runtime refused to initialize the artifact
    InitFailed(String),
}

impl fmt::Display for OmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OmissionReason::Missing => f.write_str("artifact not found"),
            OmissionReason::WrongFormat => f.write_str("wrong artifact format"),
            OmissionReason::InitFailed(cause) => write!(f, "initialization failed: {}", cause),
        }
    }
}

/// One artifact that was requested but not loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Omission {
    /// Family the classifier belongs to; `None` for the relevance detector
    pub family: Option<DiseaseFamily>,
    pub model: String,
    pub path: PathBuf,
    pub reason: OmissionReason,
}

/// Owner of every classifier and detector handle.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    classifiers: BTreeMap<DiseaseFamily, BTreeMap<String, ModelHandle>>,
    detector: Option<ModelHandle>,
    omissions: Vec<Omission>,
}

impl ModelRegistry {
    /// Empty registry; handles are added with [`with_classifier`] and
    /// [`with_detector`].
    ///
    /// [`with_classifier`]: ModelRegistry::with_classifier
    /// [`with_detector`]: ModelRegistry::with_detector
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every configured artifact through `source`.
    pub fn load(config: &AppConfig, source: &dyn ModelSource) -> Self {
        let mut registry = Self::new();

        if let Some(path) = &config.models.detector {
            registry.detector = registry.load_artifact(source, None, "autoencoder", path);
        } else {
            info!("No relevance detector configured, gate disabled");
        }

        for (family, family_config) in config.families.iter() {
            for (name, path) in &family_config.models {
                if let Some(handle) = registry.load_artifact(source, Some(family), name, path) {
                    registry
                        .classifiers
                        .entry(family)
                        .or_default()
                        .insert(name.clone(), handle);
                }
            }

            info!(
                family = %family,
                loaded = registry.classifier_count(family),
                requested = family_config.models.len(),
                "Classifier set loaded"
            );
        }

        if !registry.omissions.is_empty() {
            warn!(
                omitted = registry.omissions.len(),
                "Some model artifacts were not loaded"
            );
        }

        registry
    }

    fn load_artifact(
        &mut self,
        source: &dyn ModelSource,
        family: Option<DiseaseFamily>,
        name: &str,
        path: &Path,
    ) -> Option<ModelHandle> {
        let reason = if !path.exists() {
            OmissionReason::Missing
        } else if !has_extension(path, source.extension()) {
            OmissionReason::WrongFormat
        } else {
            match source.open(name, path) {
                Ok(model) => return Some(ModelHandle::new(name, model)),
                Err(e) => OmissionReason::InitFailed(format!("{:#}", e)),
            }
        };

        warn!(
            model = %name,
            family = ?family,
            path = %path.display(),
            reason = %reason,
            "Model artifact omitted"
        );
        self.omissions.push(Omission {
            family,
            model: name.to_string(),
            path: path.to_path_buf(),
            reason,
        });
        None
    }

    /// Register an already constructed classifier.
    pub fn with_classifier(
        mut self,
        family: DiseaseFamily,
        name: &str,
        model: Box<dyn InferenceModel>,
    ) -> Self {
        self.classifiers
            .entry(family)
            .or_default()
            .insert(name.to_string(), ModelHandle::new(name, model));
        self
    }

    /// Register an already constructed relevance detector.
    pub fn with_detector(mut self, model: Box<dyn InferenceModel>) -> Self {
        self.detector = Some(ModelHandle::new("autoencoder", model));
        self
    }

    /// Usable classifiers for `family`, keyed by model identifier.
    pub fn classifiers(&self, family: DiseaseFamily) -> Result<&BTreeMap<String, ModelHandle>> {
        self.classifiers
            .get(&family)
            .filter(|handles| !handles.is_empty())
            .ok_or(PipelineError::ModelsUnavailable { family })
    }

    pub fn classifier_count(&self, family: DiseaseFamily) -> usize {
        self.classifiers.get(&family).map_or(0, BTreeMap::len)
    }

    /// Identifiers of the loaded classifiers for `family`.
    pub fn model_names(&self, family: DiseaseFamily) -> Vec<String> {
        self.classifiers
            .get(&family)
            .map(|handles| handles.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn detector(&self) -> Option<&ModelHandle> {
        self.detector.as_ref()
    }

    /// Artifacts that were requested but not loaded.
    pub fn omissions(&self) -> &[Omission] {
        &self.omissions
    }
}

fn has_extension(path: &Path, expected: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

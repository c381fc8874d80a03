//! Configuration management for the screening pipeline

use crate::models::relevance::ThresholdProfile;
use crate::preprocess::PixelScale;
use crate::types::family::{DiseaseFamily, Taxonomy};
use anyhow::{bail, Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub models: ModelsConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    /// Model set, weights and taxonomy per disease family
    pub families: FamiliesConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Runtime-wide model settings
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Relevance detector (autoencoder) artifact; gate disabled when absent
    #[serde(default)]
    pub detector: Option<PathBuf>,
    /// Number of threads for ONNX inference per model (default: 1)
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
}

fn default_onnx_threads() -> usize {
    1
}

/// Relevance gate configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelevanceConfig {
    /// Named threshold: "strict" (default) or "smooth"
    #[serde(default)]
    pub profile: ThresholdProfile,
    /// Explicit threshold, overrides the profile
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl RelevanceConfig {
    /// Threshold in effect.
    pub fn threshold(&self) -> f64 {
        self.threshold.unwrap_or_else(|| self.profile.threshold())
    }
}

/// Per-family ensembles, one section per known family
#[derive(Debug, Clone, Deserialize)]
pub struct FamiliesConfig {
    pub fmd: FamilyConfig,
    pub lsd: FamilyConfig,
}

impl FamiliesConfig {
    pub fn get(&self, family: DiseaseFamily) -> &FamilyConfig {
        match family {
            DiseaseFamily::Fmd => &self.fmd,
            DiseaseFamily::Lsd => &self.lsd,
        }
    }

    pub fn get_mut(&mut self, family: DiseaseFamily) -> &mut FamilyConfig {
        match family {
            DiseaseFamily::Fmd => &mut self.fmd,
            DiseaseFamily::Lsd => &mut self.lsd,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (DiseaseFamily, &FamilyConfig)> + '_ {
        DiseaseFamily::ALL
            .into_iter()
            .map(move |family| (family, self.get(family)))
    }
}

/// One disease family's ensemble
#[derive(Debug, Clone, Deserialize)]
pub struct FamilyConfig {
    /// Class names in classifier output order
    pub taxonomy: Taxonomy,
    /// Pixel range the family's classifiers were trained on
    #[serde(default)]
    pub pixel_scale: PixelScale,
    /// Model identifier -> artifact path
    pub models: BTreeMap<String, PathBuf>,
    /// Model identifier -> voting weight
    pub weights: BTreeMap<String, f64>,
}

/// Batch processing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of images screened concurrently
    pub workers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.relevance.threshold();
        if !threshold.is_finite() || threshold <= 0.0 {
            bail!("Relevance threshold must be a positive number, got {}", threshold);
        }

        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }

        for (family, family_config) in self.families.iter() {
            if family_config.taxonomy.len() < 2 {
                bail!("Taxonomy for {} needs at least two classes", family);
            }

            for (model, &weight) in &family_config.weights {
                if !weight.is_finite() || weight < 0.0 {
                    bail!(
                        "Weight for {} model {} must be finite and non-negative, got {}",
                        family,
                        model,
                        weight
                    );
                }
            }

            for model in family_config.models.keys() {
                if family_config.weights.get(model).copied().unwrap_or(0.0) == 0.0 {
                    warn!(family = %family, model = %model, "Model has no weight and will not vote");
                }
            }
        }

        Ok(())
    }
}

fn default_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("v2b0".to_string(), 0.2),
        ("v2s".to_string(), 0.5),
        ("vgg16".to_string(), 1.5),
        ("resnet50".to_string(), 0.5),
        ("b0".to_string(), 0.3),
    ])
}

fn model_paths(dir: &str, files: [(&str, &str); 5]) -> BTreeMap<String, PathBuf> {
    files
        .into_iter()
        .map(|(name, file)| (name.to_string(), Path::new(dir).join(file)))
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        let fmd = FamilyConfig {
            taxonomy: Taxonomy::new(["FMD-Knuckles", "FMD-Mouth", "Healthy-Foot", "Healthy-Muzzle"]),
            pixel_scale: PixelScale::Raw,
            models: model_paths(
                "models/fmd",
                [
                    ("v2b0", "EfficientNetV2B0_model.onnx"),
                    ("v2s", "EfficientNetV2S_model.onnx"),
                    ("vgg16", "VGG16_model.onnx"),
                    ("resnet50", "ResNet50_model.onnx"),
                    ("b0", "EfficientNetB0_model.onnx"),
                ],
            ),
            weights: default_weights(),
        };

        let lsd = FamilyConfig {
            taxonomy: Taxonomy::binary(),
            pixel_scale: PixelScale::Raw,
            models: model_paths(
                "models/lsd",
                [
                    ("v2b0", "LSDEfficientNetV2B0.onnx"),
                    ("v2s", "LSDEfficientNetV2S.onnx"),
                    ("vgg16", "LSDVGG16.onnx"),
                    ("resnet50", "LSDResNet50.onnx"),
                    ("b0", "LSDEfficientNetB0.onnx"),
                ],
            ),
            weights: default_weights(),
        };

        Self {
            models: ModelsConfig {
                detector: Some(PathBuf::from("models/cow_autoencoder_flex.onnx")),
                onnx_threads: 1,
            },
            relevance: RelevanceConfig::default(),
            families: FamiliesConfig { fmd, lsd },
            pipeline: PipelineConfig { workers: 4 },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

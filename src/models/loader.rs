//! ONNX model loader

use crate::preprocess::ImageTensor;
use anyhow::{anyhow, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info};

/// A loaded model that maps one image tensor to a flat float output.
///
/// Classifiers return one score per class; the relevance detector returns a
/// reconstruction with the same element count as its input. Running a model
/// mutates its session state, so callers need exclusive access.
pub trait InferenceModel: Send {
    fn run(&mut self, input: &ImageTensor) -> Result<Vec<f32>>;
}

/// Something that can turn an artifact on disk into a runnable model.
pub trait ModelSource {
    /// File extension (without the dot) of artifacts this source understands.
    fn extension(&self) -> &str;

    fn open(&self, name: &str, path: &Path) -> Result<Box<dyn InferenceModel>>;
}

/// Loaded ONNX model with metadata
pub struct LoadedModel {
    /// Model name
    pub name: String,
    /// ONNX Runtime session
    pub session: Session,
    /// Input name for the model
    pub input_name: String,
    /// Output name read after each run
    pub output_name: String,
}

impl InferenceModel for LoadedModel {
    fn run(&mut self, input: &ImageTensor) -> Result<Vec<f32>> {
        let input_tensor =
            Tensor::from_array(input.to_array()).context("Failed to create input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        let output = outputs
            .get(&self.output_name)
            .ok_or_else(|| anyhow!("Output '{}' not found", self.output_name))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .context("Model output is not an f32 tensor")?;

        debug!(model = %self.name, shape = ?shape, "Model run complete");

        Ok(data.to_vec())
    }
}

/// Loader for ONNX models
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a new model loader with specified number of threads
    pub fn with_threads(onnx_threads: usize) -> Result<Self> {
        ort::init().commit()?;
        info!(onnx_threads = onnx_threads, "ONNX Runtime initialized");
        Ok(Self { onnx_threads })
    }

    /// Load a single ONNX model from file
    pub fn load_model<P: AsRef<Path>>(&self, path: P, name: &str) -> Result<LoadedModel> {
        let path = path.as_ref();

        info!(model = %name, path = %path.display(), threads = self.onnx_threads, "Loading ONNX model");

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.onnx_threads)?
            .commit_from_file(path)
            .context(format!("Failed to load model from {:?}", path))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| anyhow!("Model {} declares no inputs", name))?;

        // Keras exports put the softmax / reconstruction first
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| anyhow!("Model {} declares no outputs", name))?;

        info!(
            model = %name,
            input = %input_name,
            output = %output_name,
            "Model loaded successfully"
        );

        Ok(LoadedModel {
            name: name.to_string(),
            session,
            input_name,
            output_name,
        })
    }
}

impl ModelSource for ModelLoader {
    fn extension(&self) -> &str {
        "onnx"
    }

    fn open(&self, name: &str, path: &Path) -> Result<Box<dyn InferenceModel>> {
        Ok(Box::new(self.load_model(path, name)?))
    }
}

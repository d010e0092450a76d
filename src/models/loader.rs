//! Model artifact loader

use crate::error::Result;
use crate::models::{onnx, pmml, LoadedModel, ModelFormat};
use tracing::info;

/// Loader turning deployed artifacts into evaluators
#[derive(Debug, Clone)]
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a new model loader with default settings (1 thread)
    pub fn new() -> Self {
        Self::with_threads(1)
    }

    /// Create a new model loader with specified number of threads
    pub fn with_threads(onnx_threads: usize) -> Self {
        Self {
            onnx_threads: onnx_threads.max(1),
        }
    }

    /// Parse an artifact of the given format.
    ///
    /// Fails with `InvalidArtifact` when the bytes are not a model this
    /// server can evaluate. CPU bound; callers run it off the async runtime.
    pub fn load(&self, artifact: &[u8], format: ModelFormat) -> Result<LoadedModel> {
        info!(format = %format, bytes = artifact.len(), threads = self.onnx_threads, "Loading model");

        let model = match format {
            ModelFormat::Pmml => pmml::load(artifact)?,
            ModelFormat::Onnx => onnx::load(artifact, self.onnx_threads)?,
        };

        info!(
            format = %format,
            model_type = %model.model_type,
            inputs = model.input_schema.len(),
            outputs = model.output_schema.len(),
            "Model loaded successfully"
        );

        Ok(model)
    }
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self::new()
    }
}

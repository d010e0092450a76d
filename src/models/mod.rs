//! Model formats, loading and evaluation

pub mod aggregator;
pub mod inference;
pub mod loader;
pub mod onnx;
pub mod pmml;

pub use aggregator::ScoreAggregator;
pub use inference::InferenceEngine;
pub use loader::ModelLoader;

use crate::error::{Result, ServingError};
use crate::types::{FieldSpec, Record};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported artifact formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelFormat {
    /// Predictive Model Markup Language (tree models and tree ensembles)
    Pmml,
    /// Open Neural Network Exchange (tensor graphs)
    Onnx,
}

impl ModelFormat {
    /// Map a deploy `Content-Type` to a format
    pub fn from_mime(mime: &str) -> Result<Self> {
        match crate::codec::essence(mime).as_str() {
            "application/xml" | "text/xml" | "application/pmml+xml" => Ok(ModelFormat::Pmml),
            "application/octet-stream" | "application/x-onnx" | "application/vnd.onnx" => {
                Ok(ModelFormat::Onnx)
            }
            _ => Err(ServingError::UnsupportedFormat(mime.to_string())),
        }
    }

    /// Guess the format of an artifact sent without a content type
    pub fn sniff(artifact: &[u8]) -> Self {
        let body = artifact.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(artifact);
        match body.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'<') => ModelFormat::Pmml,
            _ => ModelFormat::Onnx,
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFormat::Pmml => f.write_str("PMML"),
            ModelFormat::Onnx => f.write_str("ONNX"),
        }
    }
}

/// Format-specific model runtime chosen once at deploy time.
///
/// Implementations must be safe to call from many requests at once.
pub trait Evaluator: Send + Sync {
    /// Score every input row, producing one output row per input row with the
    /// columns of the model's output schema.
    fn evaluate(&self, rows: &[Record]) -> Result<Vec<Record>>;
}

/// A parsed artifact together with the schema derived from it
pub struct LoadedModel {
    /// Model element or runtime, e.g. `TreeModel`, `MiningModel`, `ONNX`
    pub model_type: String,
    /// PMML mining function (`classification` / `regression`)
    pub function: Option<String>,
    pub input_schema: Vec<FieldSpec>,
    pub output_schema: Vec<FieldSpec>,
    pub evaluator: Box<dyn Evaluator>,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_type", &self.model_type)
            .field("function", &self.function)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .finish_non_exhaustive()
    }
}

//! AI-Serving Library
//!
//! A model serving core that hosts versioned PMML and ONNX models and
//! scores JSON or binary prediction requests against them over HTTP.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feature_extractor;
pub mod filter;
pub mod http;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod types;

pub use config::AppConfig;
pub use dispatcher::Dispatcher;
pub use error::{Result, ServingError};
pub use feature_extractor::FeatureExtractor;
pub use models::inference::InferenceEngine;
pub use registry::ModelRegistry;
pub use types::{Record, RecordBatch, Value};

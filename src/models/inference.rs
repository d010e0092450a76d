//! Inference executor: runs a model version over a record batch

use crate::error::Result;
use crate::filter::OutputFilter;
use crate::metrics::ServingMetrics;
use crate::registry::ModelVersion;
use crate::types::RecordBatch;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Inference engine shared by every request
pub struct InferenceEngine {
    metrics: Arc<ServingMetrics>,
}

impl InferenceEngine {
    pub fn new(metrics: Arc<ServingMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<ServingMetrics> {
        &self.metrics
    }

    /// Score a batch with one model version.
    ///
    /// Produces one output row per input row carrying the model's output
    /// columns, restricted to `filter` when given. The result keeps the
    /// orientation of `batch`. Blocking; run it off the async runtime.
    pub fn predict(
        &self,
        model: &ModelVersion,
        batch: &RecordBatch,
        filter: Option<&[String]>,
    ) -> Result<RecordBatch> {
        // Reject a bad filter before spending time on evaluation.
        let filter = filter
            .map(|columns| OutputFilter::new(columns, model.output_schema()))
            .transpose()?;

        let rows = batch.to_records();
        let start = Instant::now();
        let mut outputs = model.evaluator().evaluate(&rows)?;
        let elapsed = start.elapsed();
        self.metrics
            .record_model_time(&format!("{}:{}", model.name(), model.version()), elapsed);

        if let Some(filter) = &filter {
            outputs = filter.apply(outputs);
        }

        let columns: Vec<String> = match &filter {
            Some(filter) => filter.columns().to_vec(),
            None => model.output_schema().iter().map(|f| f.name.clone()).collect(),
        };

        debug!(
            model = %model.name(),
            version = model.version(),
            rows = rows.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "Inference complete"
        );

        Ok(RecordBatch::from_records(outputs, batch.orientation(), Some(columns)))
    }
}

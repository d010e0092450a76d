//! Performance metrics and statistics tracking for the model server.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for serving performance
pub struct ServingMetrics {
    /// Prediction requests received
    pub requests: AtomicU64,
    /// Prediction requests answered successfully
    pub predictions: AtomicU64,
    /// Rows scored across all predictions
    pub rows_scored: AtomicU64,
    /// Successful deploys
    pub deploys: AtomicU64,
    /// Rejected deploys
    pub failed_deploys: AtomicU64,
    /// Failures by error kind
    errors_by_kind: RwLock<HashMap<String, u64>>,
    /// End-to-end prediction times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Evaluation times per model version (in microseconds)
    model_times: RwLock<HashMap<String, Vec<u64>>>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl ServingMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            predictions: AtomicU64::new(0),
            rows_scored: AtomicU64::new(0),
            deploys: AtomicU64::new(0),
            failed_deploys: AtomicU64::new(0),
            errors_by_kind: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            model_times: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record an incoming prediction request
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed prediction
    pub fn record_prediction(&self, processing_time: Duration, rows: usize) {
        self.predictions.fetch_add(1, Ordering::Relaxed);
        self.rows_scored.fetch_add(rows as u64, Ordering::Relaxed);

        let mut times = self.processing_times.write();
        times.push(processing_time.as_micros() as u64);
        // Keep only last 10000 for memory efficiency
        if times.len() > 10000 {
            times.drain(0..5000);
        }
    }

    /// Record a successful deploy
    pub fn record_deploy(&self) {
        self.deploys.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected deploy
    pub fn record_deploy_error(&self, kind: &str) {
        self.failed_deploys.fetch_add(1, Ordering::Relaxed);
        self.record_error(kind);
    }

    /// Record a failed request
    pub fn record_error(&self, kind: &str) {
        *self.errors_by_kind.write().entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Record model evaluation time
    pub fn record_model_time(&self, model_name: &str, duration: Duration) {
        let mut times = self.model_times.write();
        let model_times = times.entry(model_name.to_string()).or_default();
        model_times.push(duration.as_micros() as u64);
        // Keep only last 1000 per model
        if model_times.len() > 1000 {
            model_times.drain(0..500);
        }
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let times = self.processing_times.read();
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: sorted[(count as f64 * 0.95) as usize],
            p99_us: sorted[(count as f64 * 0.99) as usize],
            max_us: *sorted.last().unwrap_or(&0),
        }
    }

    /// Get per-model performance stats
    pub fn get_model_stats(&self) -> BTreeMap<String, ModelStats> {
        let times = self.model_times.read();
        let mut stats = BTreeMap::new();

        for (model, model_times) in times.iter() {
            if model_times.is_empty() {
                continue;
            }

            let mut sorted: Vec<u64> = model_times.clone();
            sorted.sort_unstable();

            let sum: u64 = sorted.iter().sum();
            let count = sorted.len();

            stats.insert(
                model.clone(),
                ModelStats {
                    calls: count as u64,
                    mean_us: sum / count as u64,
                    p50_us: sorted[count / 2],
                    p99_us: sorted[(count as f64 * 0.99) as usize],
                },
            );
        }

        stats
    }

    /// Get current throughput (predictions per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.predictions.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get failures by error kind
    pub fn get_errors_by_kind(&self) -> BTreeMap<String, u64> {
        self.errors_by_kind
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Point-in-time copy of every counter, served on `/metrics`
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            requests: self.requests.load(Ordering::Relaxed),
            predictions: self.predictions.load(Ordering::Relaxed),
            rows_scored: self.rows_scored.load(Ordering::Relaxed),
            deploys: self.deploys.load(Ordering::Relaxed),
            failed_deploys: self.failed_deploys.load(Ordering::Relaxed),
            throughput: self.get_throughput(),
            errors: self.get_errors_by_kind(),
            processing: self.get_processing_stats(),
            models: self.get_model_stats(),
        }
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        let error_count = snapshot.error_count();
        let error_rate = snapshot.error_rate() * 100.0;
        let processing = &snapshot.processing;

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║               MODEL SERVING - METRICS SUMMARY                ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Predictions:  {:>8}  │  Throughput: {:>8.1} req/s          ║",
            snapshot.predictions, snapshot.throughput
        );
        info!(
            "║ Rows Scored:  {:>8}  │  Deploys:    {:>8}                ║",
            snapshot.rows_scored, snapshot.deploys
        );
        info!(
            "║ Errors:       {:>8}  │  Error Rate: {:>7.1}%               ║",
            error_count, error_rate
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Latency (μs): mean={:>6} p50={:>6} p95={:>6} p99={:>6}   ║",
            processing.mean_us, processing.p50_us, processing.p95_us, processing.p99_us
        );
        if !snapshot.errors.is_empty() {
            info!("╠══════════════════════════════════════════════════════════════╣");
            info!("║ Errors by Kind:                                              ║");
            for (kind, count) in &snapshot.errors {
                info!("║   {:24}: {:>8}                          ║", kind, count);
            }
        }
        info!("╚══════════════════════════════════════════════════════════════╝");

        if !snapshot.models.is_empty() {
            info!("Model Evaluation Times (μs):");
            for (model, stats) in &snapshot.models {
                info!(
                    "  {}: mean={} p50={} p99={} (calls={})",
                    model, stats.mean_us, stats.p50_us, stats.p99_us, stats.calls
                );
            }
        }
    }
}

impl Default for ServingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Model-specific statistics
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub calls: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub predictions: u64,
    pub rows_scored: u64,
    pub deploys: u64,
    pub failed_deploys: u64,
    pub throughput: f64,
    pub errors: BTreeMap<String, u64>,
    pub processing: ProcessingStats,
    pub models: BTreeMap<String, ModelStats>,
}

impl MetricsSnapshot {
    pub fn error_count(&self) -> u64 {
        self.errors.values().sum()
    }

    /// Share of operations (predict requests and deploy attempts) that failed
    pub fn error_rate(&self) -> f64 {
        let operations = self.requests + self.deploys + self.failed_deploys;
        if operations == 0 {
            return 0.0;
        }
        self.error_count() as f64 / operations as f64
    }
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: Arc<ServingMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<ServingMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

//! AI-Serving - Main Entry Point
//!
//! Hosts PMML and ONNX models behind an HTTP API for deployment,
//! metadata lookup and prediction.

use ai_serving::{
    config::AppConfig,
    dispatcher::Dispatcher,
    http::{self, AppState},
    metrics::{MetricsReporter, ServingMetrics},
    models::{InferenceEngine, ModelLoader},
    registry::ModelRegistry,
};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ai-serving", version, about = "Serve PMML and ONNX models over HTTP")]
struct Args {
    /// Configuration file (defaults to config/config.toml when present)
    #[arg(short, long, env = "AI_SERVING_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };

    init_logging(&config)?;

    info!("Starting AI-Serving");
    info!(
        "Request timeout: {:?}, deploy timeout: {:?}, ONNX threads: {}",
        config.server.request_timeout(),
        config.models.deploy_timeout(),
        config.models.onnx_threads
    );

    // Initialize metrics
    let metrics = Arc::new(ServingMetrics::new());

    // Initialize components
    let loader = ModelLoader::with_threads(config.models.onnx_threads);
    let registry = Arc::new(ModelRegistry::new(loader, config.models.deploy_timeout()));
    let engine = Arc::new(InferenceEngine::new(metrics.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        engine,
        config.server.request_timeout(),
    ));

    // Start metrics reporter
    if config.metrics.report_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics.clone(), config.metrics.report_interval_secs);
        tokio::spawn(reporter.start());
    }

    http::serve(AppState::new(dispatcher), &config.server).await?;

    // Print final summary
    info!("AI-Serving shutting down...");
    metrics.print_summary();

    Ok(())
}

fn init_logging(config: &AppConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)?,
    };

    if config.logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

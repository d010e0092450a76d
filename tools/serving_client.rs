//! Serving Client
//!
//! Deploys artifacts to a running AI-Serving instance, reads model metadata
//! and sends prediction requests, optionally checking the result against an
//! expected table.

use ai_serving::codec::{self, ContentType, PredictRequest};
use ai_serving::types::RecordBatch;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "serving-client", about = "Talk to an AI-Serving instance")]
struct Args {
    /// Base URL of the server
    #[arg(long, default_value = "http://localhost:9090")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the server is up
    Up,
    /// Deploy a PMML or ONNX artifact
    Deploy {
        name: String,
        artifact: PathBuf,
        /// Content type sent with the artifact; sniffed by the server when omitted
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Show model metadata (all versions unless one is given)
    Metadata {
        name: String,
        #[arg(long)]
        version: Option<u32>,
    },
    /// Score a JSON input table
    Predict {
        name: String,
        /// JSON file holding the input table (records or split)
        input: PathBuf,
        #[arg(long)]
        version: Option<u32>,
        /// Send and receive the binary encoding
        #[arg(long)]
        binary: bool,
        /// Output columns to keep, comma separated
        #[arg(long, value_delimiter = ',')]
        filter: Option<Vec<String>>,
        /// JSON file holding the expected result table
        #[arg(long)]
        expected: Option<PathBuf>,
        #[arg(long, default_value_t = 1e-3)]
        tolerance: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("serving_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/').to_string();

    match args.command {
        Command::Up => {
            let response = client.get(format!("{}/up", base)).send().await?;
            let status = response.status();
            let body = response.text().await?;
            info!(status = %status, "{}", body);
        }
        Command::Deploy {
            name,
            artifact,
            content_type,
        } => {
            let bytes = std::fs::read(&artifact)
                .with_context(|| format!("Failed to read artifact {}", artifact.display()))?;
            let mut request = client.put(format!("{}/v1/models/{}", base, name)).body(bytes);
            if let Some(content_type) = content_type {
                request = request.header(CONTENT_TYPE, content_type);
            }
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                bail!("Deploy failed ({}): {}", status, body);
            }
            info!(model = %name, "Deployed: {}", body);
        }
        Command::Metadata { name, version } => {
            let url = match version {
                Some(v) => format!("{}/v1/models/{}/versions/{}", base, name, v),
                None => format!("{}/v1/models/{}", base, name),
            };
            let response = client.get(url).send().await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                bail!("Metadata lookup failed ({}): {}", status, body);
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Predict {
            name,
            input,
            version,
            binary,
            filter,
            expected,
            tolerance,
        } => {
            let table = read_table(&input)?;
            let mut request = PredictRequest::new(table);
            if let Some(filter) = filter {
                request = request.with_filter(filter);
            }

            let content_type = if binary {
                ContentType::Binary
            } else {
                ContentType::Json
            };
            let body = codec::encode_request(content_type, &request)?;
            let url = match version {
                Some(v) => format!("{}/v1/models/{}/versions/{}", base, name, v),
                None => format!("{}/v1/models/{}", base, name),
            };

            let start = Instant::now();
            let response = client
                .post(url)
                .header(CONTENT_TYPE, content_type.mime())
                .body(body)
                .send()
                .await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            let elapsed = start.elapsed();
            if !status.is_success() {
                bail!(
                    "Prediction failed ({}): {}",
                    status,
                    String::from_utf8_lossy(&bytes)
                );
            }

            let result = codec::decode_response(content_type, &bytes)?;
            info!(
                rows = result.num_rows(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Prediction received"
            );
            let printable = codec::encode_response(ContentType::Json, &result)?;
            println!("{}", String::from_utf8_lossy(&printable));

            if let Some(expected) = expected {
                let expected = read_table(&expected)?;
                if result.approx_eq(&expected, tolerance) {
                    info!(tolerance, "Result matches expected table");
                } else {
                    warn!(tolerance, "Result differs from expected table");
                    bail!("Result does not match expected table");
                }
            }
        }
    }

    Ok(())
}

fn read_table(path: &Path) -> Result<RecordBatch> {
    let text = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut json: serde_json::Value =
        serde_json::from_slice(&text).with_context(|| format!("{} is not JSON", path.display()))?;
    // Accept a bare table or one wrapped as a request or response
    let inner = json
        .as_object_mut()
        .and_then(|map| map.remove("X").or_else(|| map.remove("result")));
    if let Some(inner) = inner {
        json = inner;
    }
    Ok(codec::json::table_from_json(json)?)
}

//! Server setup and configuration.

use super::{handlers, health, AppState};
use crate::config::ServerConfig;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the serving router.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/up", get(health::up))
        .route("/metrics", get(health::metrics))
        .route("/v1/models", get(handlers::list_models))
        .route(
            "/v1/models/:name",
            put(handlers::deploy)
                .get(handlers::model_versions)
                .post(handlers::predict_latest),
        )
        .route(
            "/v1/models/:name/versions/:version",
            get(handlers::version_metadata).post(handlers::predict_version),
        )
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Start the server and run until Ctrl-C.
pub async fn serve(state: AppState, config: &ServerConfig) -> anyhow::Result<()> {
    let app = build_router(state, config);
    let addr = config.bind_address();

    info!("AI-Serving listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

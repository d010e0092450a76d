//! Model endpoints: deploy, metadata and predict.

use super::AppState;
use crate::error::ServingError;
use crate::registry::{ModelMetadata, ServableSummary};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

const REQUEST_ID: &str = "x-request-id";

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub name: String,
    pub versions: Vec<ModelMetadata>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ServingError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if self.is_client_error() {
            warn!(error = %self, kind = self.kind(), status = status.as_u16(), "Request rejected");
        } else {
            error!(error = %self, kind = self.kind(), status = status.as_u16(), "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

fn parse_version(name: &str, version: &str) -> Result<u32, ServingError> {
    version
        .parse::<u32>()
        .map_err(|_| ServingError::NotFound(format!("model '{}' version '{}'", name, version)))
}

/// `PUT /v1/models/:name`
pub async fn deploy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DeployResponse>), ServingError> {
    let model = state
        .dispatcher
        .deploy(&name, content_type(&headers).as_deref(), body.to_vec())
        .await?;

    info!(model = %name, version = model.version(), "Model deployed");
    Ok((
        StatusCode::CREATED,
        Json(DeployResponse {
            name: model.name().to_string(),
            version: model.version(),
        }),
    ))
}

/// `GET /v1/models`
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ServableSummary>> {
    Json(state.dispatcher.registry().list())
}

/// `GET /v1/models/:name`
pub async fn model_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VersionsResponse>, ServingError> {
    let versions = state.dispatcher.registry().versions(&name)?;
    Ok(Json(VersionsResponse { name, versions }))
}

/// `GET /v1/models/:name/versions/:version`
pub async fn version_metadata(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<ModelMetadata>, ServingError> {
    let version = parse_version(&name, &version)?;
    let metadata = state.dispatcher.registry().get_metadata(&name, Some(version))?;
    Ok(Json(metadata))
}

/// `POST /v1/models/:name`
pub async fn predict_latest(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServingError> {
    predict(state, name, None, headers, body).await
}

/// `POST /v1/models/:name/versions/:version`
pub async fn predict_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServingError> {
    let version = parse_version(&name, &version)?;
    predict(state, name, Some(version), headers, body).await
}

async fn predict(
    state: AppState,
    name: String,
    version: Option<u32>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServingError> {
    let request_id = Uuid::new_v4().to_string();
    let response = state
        .dispatcher
        .predict(&name, version, content_type(&headers).as_deref(), body.to_vec())
        .await?;

    let mut http = (
        [(CONTENT_TYPE, HeaderValue::from_static(response.content_type.mime()))],
        response.body,
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        http.headers_mut().insert(REQUEST_ID, value);
    }
    Ok(http)
}

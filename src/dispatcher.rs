//! Routes requests to servables and runs the predict pipeline:
//! decode, resolve, evaluate, filter, encode.

use crate::codec::{self, ContentType};
use crate::error::{Result, ServingError};
use crate::metrics::ServingMetrics;
use crate::models::{InferenceEngine, ModelFormat};
use crate::registry::{ModelRegistry, ModelVersion};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Deployment state of a servable name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServableState {
    Undeployed,
    /// Deployed versions, ascending
    Active(Vec<u32>),
}

/// Encoded predict response
#[derive(Debug, Clone)]
pub struct PredictResponse {
    pub content_type: ContentType,
    pub body: Vec<u8>,
}

pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    engine: Arc<InferenceEngine>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelRegistry>, engine: Arc<InferenceEngine>, request_timeout: Duration) -> Self {
        Self {
            registry,
            engine,
            request_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ServingMetrics> {
        self.engine.metrics()
    }

    pub fn state(&self, name: &str) -> ServableState {
        match self.registry.version_numbers(name) {
            Some(versions) if !versions.is_empty() => ServableState::Active(versions),
            _ => ServableState::Undeployed,
        }
    }

    /// Deploy an artifact; the format comes from `content_type` or, without
    /// one, from sniffing the body.
    pub async fn deploy(
        &self,
        name: &str,
        content_type: Option<&str>,
        artifact: Vec<u8>,
    ) -> Result<Arc<ModelVersion>> {
        let result = self.deploy_inner(name, content_type, artifact).await;
        match &result {
            Ok(_) => self.metrics().record_deploy(),
            Err(e) => self.metrics().record_deploy_error(e.kind()),
        }
        result
    }

    async fn deploy_inner(
        &self,
        name: &str,
        content_type: Option<&str>,
        artifact: Vec<u8>,
    ) -> Result<Arc<ModelVersion>> {
        let format = match content_type {
            Some(mime) if !mime.trim().is_empty() => ModelFormat::from_mime(mime)?,
            _ => ModelFormat::sniff(&artifact),
        };
        info!(model = %name, format = %format, bytes = artifact.len(), "Deploying model");
        self.registry.deploy(name, format, artifact).await
    }

    /// Score a request body against `name` (latest version when `version`
    /// is omitted). The response uses the request's encoding and layout.
    pub async fn predict(
        &self,
        name: &str,
        version: Option<u32>,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<PredictResponse> {
        self.metrics().record_request();
        let start = Instant::now();
        let result = self.predict_inner(name, version, content_type, body).await;
        match &result {
            Ok((response, rows)) => {
                self.metrics().record_prediction(start.elapsed(), *rows);
                debug!(
                    model = %name,
                    rows = *rows,
                    bytes = response.body.len(),
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "Prediction served"
                );
            }
            Err(e) => self.metrics().record_error(e.kind()),
        }
        result.map(|(response, _)| response)
    }

    async fn predict_inner(
        &self,
        name: &str,
        version: Option<u32>,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(PredictResponse, usize)> {
        let content_type = ContentType::from_header(content_type)?;
        let model = self.registry.resolve(name, version)?;
        let engine = self.engine.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, usize)> {
            let request = codec::decode_request(content_type, &body)?;
            let rows = request.x.num_rows();
            let result = engine.predict(&model, &request.x, request.filter.as_deref())?;
            Ok((codec::encode_response(content_type, &result)?, rows))
        });

        match tokio::time::timeout(self.request_timeout, task).await {
            Ok(Ok(result)) => {
                let (body, rows) = result?;
                Ok((PredictResponse { content_type, body }, rows))
            }
            Ok(Err(e)) => Err(ServingError::Internal(format!("prediction worker failed: {}", e))),
            Err(_) => Err(ServingError::Timeout(format!(
                "prediction on '{}' took longer than {:?}",
                name, self.request_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PredictRequest;
    use crate::config::ServerConfig;
    use crate::http::{build_router, AppState};
    use crate::models::{Evaluator, LoadedModel, ModelLoader};
    use crate::types::{FieldSpec, Orientation, Record, RecordBatch, Value};
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    const IRIS: &[u8] = include_bytes!("../tests/fixtures/iris_tree.pmml");

    /// Answers every row with `y = 1`, but only after `delay`
    struct SlowModel {
        delay: Duration,
    }

    impl Evaluator for SlowModel {
        fn evaluate(&self, rows: &[Record]) -> Result<Vec<Record>> {
            std::thread::sleep(self.delay);
            Ok(rows
                .iter()
                .map(|_| [("y".to_string(), Value::Float(1.0))].into_iter().collect())
                .collect())
        }
    }

    fn slow_dispatcher(delay: Duration, request_timeout: Duration) -> Dispatcher {
        let registry = Arc::new(ModelRegistry::new(ModelLoader::default(), Duration::from_secs(30)));
        registry.register(
            "slow",
            ModelFormat::Onnx,
            LoadedModel {
                model_type: "ONNX".to_string(),
                function: None,
                input_schema: vec![FieldSpec::new("x", "tensor(double)")],
                output_schema: vec![FieldSpec::new("y", "tensor(double)")],
                evaluator: Box::new(SlowModel { delay }),
            },
        );
        let engine = Arc::new(InferenceEngine::new(Arc::new(ServingMetrics::new())));
        Dispatcher::new(registry, engine, request_timeout)
    }

    /// The iris tree behind a few megabytes of XML comment, slow to hash and parse
    fn padded_iris() -> Vec<u8> {
        let text = std::str::from_utf8(IRIS).unwrap();
        let (declaration, document) = text.split_once('\n').unwrap();
        format!("{}\n<!--{}-->\n{}", declaration, "x".repeat(4 << 20), document).into_bytes()
    }

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(ModelRegistry::new(ModelLoader::default(), Duration::from_secs(30)));
        let engine = Arc::new(InferenceEngine::new(Arc::new(ServingMetrics::new())));
        Dispatcher::new(registry, engine, Duration::from_secs(30))
    }

    fn iris_row() -> Record {
        [
            ("sepal length", 5.7),
            ("sepal width", 4.4),
            ("petal length", 1.5),
            ("petal width", 0.4),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), Value::Float(*v)))
        .collect()
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.state("iris"), ServableState::Undeployed);

        dispatcher.deploy("iris", Some("application/xml"), IRIS.to_vec()).await.unwrap();
        assert_eq!(dispatcher.state("iris"), ServableState::Active(vec![1]));

        dispatcher.deploy("iris", None, IRIS.to_vec()).await.unwrap();
        assert_eq!(dispatcher.state("iris"), ServableState::Active(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_deploy_rejects_unknown_format() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .deploy("iris", Some("application/zip"), IRIS.to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::UnsupportedFormat(_)));
        assert_eq!(dispatcher.state("iris"), ServableState::Undeployed);
    }

    #[tokio::test]
    async fn test_predict_json_and_binary_agree() {
        let dispatcher = dispatcher();
        dispatcher.deploy("iris", Some("text/xml"), IRIS.to_vec()).await.unwrap();

        let request = PredictRequest::new(RecordBatch::Records(vec![iris_row()]));
        let mut results = Vec::new();
        for content_type in [ContentType::Json, ContentType::Binary] {
            let body = codec::encode_request(content_type, &request).unwrap();
            let response = dispatcher
                .predict("iris", None, Some(content_type.mime()), body)
                .await
                .unwrap();
            assert_eq!(response.content_type, content_type);
            results.push(codec::decode_response(content_type, &response.body).unwrap());
        }

        assert_eq!(results[0].orientation(), Orientation::Records);
        assert!(results[0].approx_eq(&results[1], 1e-3));
        assert_eq!(results[0].to_records()[0]["predicted_species"], Value::from("setosa"));
    }

    #[tokio::test]
    async fn test_predict_errors() {
        let dispatcher = dispatcher();
        let err = dispatcher.predict("ghost", None, None, b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, ServingError::NotFound(_)));

        dispatcher.deploy("iris", None, IRIS.to_vec()).await.unwrap();
        let err = dispatcher
            .predict("iris", None, Some("text/csv"), b"a,b".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::UnsupportedContentType(_)));

        let err = dispatcher
            .predict("iris", Some(5), None, b"{\"X\": []}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::NotFound(_)));

        let err = dispatcher.predict("iris", None, None, b"{\"X\": ".to_vec()).await.unwrap_err();
        assert!(matches!(err, ServingError::MalformedPayload(_)));

        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.errors.get("not_found"), Some(&2));
    }

    #[tokio::test]
    async fn test_predict_timeout() {
        let dispatcher = slow_dispatcher(Duration::from_millis(300), Duration::from_millis(10));
        let err = dispatcher
            .predict("slow", None, None, br#"{"X": [{"x": 1.0}]}"#.to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::Timeout(_)), "{:?}", err);

        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.errors.get("timeout"), Some(&1));
        assert_eq!(snapshot.predictions, 0);

        // The same model answers once the budget allows it
        let patient = slow_dispatcher(Duration::from_millis(5), Duration::from_secs(30));
        let response = patient
            .predict("slow", None, None, br#"{"X": [{"x": 1.0}]}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(response.content_type, ContentType::Json);
    }

    #[tokio::test]
    async fn test_predict_timeout_is_gateway_timeout() {
        let dispatcher = slow_dispatcher(Duration::from_millis(300), Duration::from_millis(10));
        let app = build_router(AppState::new(Arc::new(dispatcher)), &ServerConfig::default());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/models/slow")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"X": [{"x": 1.0}]}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("slow"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_predictions_continue_during_deploy() {
        let dispatcher = Arc::new(dispatcher());
        dispatcher.deploy("iris", Some("application/xml"), IRIS.to_vec()).await.unwrap();
        let v1_hash = dispatcher.registry().get_metadata("iris", Some(1)).unwrap().hash;

        let deploying = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.deploy("iris", Some("application/xml"), padded_iris()).await
            })
        };

        let request = PredictRequest::new(RecordBatch::Records(vec![iris_row()]));
        let body = codec::encode_request(ContentType::Json, &request).unwrap();
        let mut served = 0;
        loop {
            let response = dispatcher
                .predict("iris", Some(1), None, body.clone())
                .await
                .unwrap();
            let result = codec::decode_response(ContentType::Json, &response.body).unwrap();
            assert_eq!(result.to_records()[0]["predicted_species"], Value::from("setosa"));
            served += 1;
            if deploying.is_finished() {
                break;
            }
        }
        assert!(served >= 1);

        let v2 = deploying.await.unwrap().unwrap();
        assert_eq!(v2.version(), 2);
        assert_eq!(dispatcher.state("iris"), ServableState::Active(vec![1, 2]));
        let v1 = dispatcher.registry().get_metadata("iris", Some(1)).unwrap();
        assert_eq!(v1.hash, v1_hash);
        assert_ne!(v2.metadata().hash, v1_hash);
        assert_eq!(dispatcher.metrics().snapshot().predictions, served);
    }
}

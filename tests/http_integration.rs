//! End-to-end tests driving the router in-process.

use ai_serving::codec::{self, ContentType, PredictRequest};
use ai_serving::config::ServerConfig;
use ai_serving::dispatcher::Dispatcher;
use ai_serving::http::{build_router, AppState};
use ai_serving::metrics::ServingMetrics;
use ai_serving::models::{InferenceEngine, ModelLoader};
use ai_serving::registry::ModelRegistry;
use ai_serving::types::{Orientation, Record, RecordBatch, Value};
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value as Json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const IRIS: &str = include_str!("fixtures/iris_tree.pmml");
const FOREST: &str = include_str!("fixtures/forest_regression.pmml");

fn app() -> Router {
    let metrics = Arc::new(ServingMetrics::new());
    let registry = Arc::new(ModelRegistry::new(ModelLoader::default(), Duration::from_secs(30)));
    let engine = Arc::new(InferenceEngine::new(metrics));
    let dispatcher = Arc::new(Dispatcher::new(registry, engine, Duration::from_secs(30)));
    build_router(AppState::new(dispatcher), &ServerConfig::default())
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> (StatusCode, Option<String>, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, bytes.to_vec())
}

async fn deploy(app: &Router, name: &str, artifact: &str) -> Json {
    let (status, _, body) = send(
        app,
        Method::PUT,
        &format!("/v1/models/{}", name),
        Some("application/xml"),
        artifact.as_bytes().to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).unwrap()
}

async fn predict_json(app: &Router, uri: &str, request: Json) -> (StatusCode, Json) {
    let (status, content_type, body) = send(
        app,
        Method::POST,
        uri,
        Some("application/json"),
        serde_json::to_vec(&request).unwrap(),
    )
    .await;
    if status.is_success() {
        assert_eq!(content_type.as_deref(), Some("application/json"));
    }
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_up() {
    let app = app();
    let (status, _, body) = send(&app, Method::GET, "/up", None, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_deploy_assigns_increasing_versions() {
    let app = app();
    assert_eq!(deploy(&app, "iris", IRIS).await, json!({"name": "iris", "version": 1}));
    assert_eq!(deploy(&app, "iris", IRIS).await, json!({"name": "iris", "version": 2}));

    let (status, _, body) = send(&app, Method::GET, "/v1/models", None, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    let list: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(list, json!([{"name": "iris", "versions": [1, 2]}]));
}

#[tokio::test]
async fn test_metadata() {
    let app = app();
    deploy(&app, "iris", IRIS).await;

    let (status, _, body) = send(&app, Method::GET, "/v1/models/iris/versions/1", None, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    let metadata: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(metadata["name"], "iris");
    assert_eq!(metadata["version"], 1);
    assert_eq!(metadata["format"], "PMML");
    assert_eq!(metadata["modelType"], "TreeModel");
    assert_eq!(metadata["inputSchema"].as_array().unwrap().len(), 4);
    assert_eq!(metadata["inputSchema"][0]["name"], "sepal length");
    assert_eq!(metadata["outputSchema"][0]["name"], "predicted_species");
    assert_eq!(metadata["hash"].as_str().unwrap().len(), 64);

    let (status, _, body) = send(&app, Method::GET, "/v1/models/iris", None, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    let versions: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(versions["versions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_iris_records_request() {
    let app = app();
    deploy(&app, "iris", IRIS).await;

    let request = json!({"X": [{
        "sepal length": 5.7,
        "sepal width": 4.4,
        "petal length": 1.5,
        "petal width": 0.4
    }]});
    let (status, body) = predict_json(&app, "/v1/models/iris", request).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let rows = body["result"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let species = rows[0]["predicted_species"].as_str().unwrap();
    assert!(!species.is_empty());
    assert_eq!(species, "setosa");
}

#[tokio::test]
async fn test_iris_split_request_with_filter() {
    let app = app();
    deploy(&app, "iris", IRIS).await;

    let request = json!({
        "X": {
            "columns": ["sepal length", "sepal width", "petal length", "petal width"],
            "data": [[5.1, 3.5, 1.4, 0.2], [6.9, 3.1, 5.4, 2.1]]
        },
        "filter": ["predicted_species"]
    });
    let (status, body) = predict_json(&app, "/v1/models/iris/versions/1", request).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(
        body,
        json!({"result": {
            "columns": ["predicted_species"],
            "data": [["setosa"], ["virginica"]]
        }})
    );
}

#[tokio::test]
async fn test_binary_matches_json() {
    let app = app();
    deploy(&app, "forest", FOREST).await;

    let rows: Vec<Record> = [(0.0, 0.0), (2.0, 0.0), (2.0, 1.0)]
        .iter()
        .map(|(x, y)| {
            [("x".to_string(), Value::Float(*x)), ("y".to_string(), Value::Float(*y))]
                .into_iter()
                .collect()
        })
        .collect();
    let request = PredictRequest::new(RecordBatch::from_records(rows, Orientation::Split, None));

    let mut results = Vec::new();
    for content_type in [ContentType::Json, ContentType::Binary] {
        let (status, returned, body) = send(
            &app,
            Method::POST,
            "/v1/models/forest",
            Some(content_type.mime()),
            codec::encode_request(content_type, &request).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(returned.as_deref(), Some(content_type.mime()));
        results.push(codec::decode_response(content_type, &body).unwrap());
    }

    assert_eq!(results[0].orientation(), Orientation::Split);
    assert!(results[0].approx_eq(&results[1], 1e-3));
    let scores: Vec<Value> = results[1]
        .to_records()
        .into_iter()
        .map(|mut r| r.swap_remove("prediction").unwrap())
        .collect();
    assert_eq!(scores, vec![Value::Float(2.0), Value::Float(7.0), Value::Float(9.0)]);
}

#[tokio::test]
async fn test_error_statuses() {
    let app = app();

    let (status, body) = predict_json(&app, "/v1/models/ghost", json!({"X": []})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    deploy(&app, "iris", IRIS).await;

    let (status, _) = predict_json(&app, "/v1/models/iris/versions/7", json!({"X": []})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = predict_json(&app, "/v1/models/iris/versions/latest", json!({"X": []})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, Method::POST, "/v1/models/iris", Some("text/csv"), b"a,b".to_vec()).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let (status, _, _) = send(&app, Method::PUT, "/v1/models/iris", Some("application/zip"), vec![1, 2, 3]).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let (status, _, _) = send(
        &app,
        Method::PUT,
        "/v1/models/broken",
        Some("application/xml"),
        b"<PMML><oops".to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, Method::POST, "/v1/models/iris", Some("application/json"), b"{\"X\": ".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let row = json!([{"sepal length": 5.1, "sepal width": 3.5, "petal length": 1.4, "petal width": 0.2}]);
    let (status, body) = predict_json(&app, "/v1/models/iris", json!({"X": row, "filter": ["nope"]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = predict_json(&app, "/v1/models/iris", json!({"X": [{"colour": "red"}]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&app, Method::GET, "/metrics", None, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["deploys"], 1);
    assert_eq!(snapshot["failed_deploys"], 2);
    assert_eq!(snapshot["errors"]["not_found"], 2);
}

/// `tests/fixtures/mnist.onnx` has the MNIST interface (input `Input3`
/// [1,1,28,28], output `Plus214_Output_0` [1,10]) but scores each class with
/// one of the first ten pixels, so the argmax is the brightest of them.
#[tokio::test]
async fn test_mnist_tensor_model() {
    let artifact = std::fs::read(Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/mnist.onnx"))
        .unwrap();

    let app = app();
    let (status, _, body) = send(
        &app,
        Method::PUT,
        "/v1/models/mnist",
        Some("application/octet-stream"),
        artifact,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));

    let (status, _, body) = send(&app, Method::GET, "/v1/models/mnist/versions/1", None, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    let metadata: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(metadata["inputSchema"][0]["shape"], json!([1, 1, 28, 28]));

    let label = 7;
    let mut pixels: Vec<f32> = (0..784).map(|i| ((i * 31) % 97) as f32 / 200.0).collect();
    pixels[label] = 0.75;
    pixels[300] = 1.0;

let image = ai_serving::types::Tensor::from_f32(vec![1, 1, 28, 28], &pixels).unwrap();
    let row: Record = [("Input3".to_string(), Value::Tensor(image))].into_iter().collect();
    let request = PredictRequest::new(RecordBatch::Records(vec![row]));

    let mut results = Vec::new();
    for content_type in [ContentType::Json, ContentType::Binary] {
        let (status, _, body) = send(
            &app,
            Method::POST,
            "/v1/models/mnist",
            Some(content_type.mime()),
            codec::encode_request(content_type, &request).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
        results.push(codec::decode_response(content_type, &body).unwrap());
    }
    assert!(results[0].approx_eq(&results[1], 1e-3));

    let output = &results[1].to_records()[0]["Plus214_Output_0"];
    let Value::Tensor(scores) = output else {
        panic!("expected a tensor output, got {:?}", output);
    };
    assert_eq!(scores.shape(), &[1, 10]);
    assert_eq!(scores.argmax(), Some(label));
}

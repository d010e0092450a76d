//! Servable registry: named, append-only lists of immutable model versions

use crate::error::{Result, ServingError};
use crate::models::{Evaluator, LoadedModel, ModelFormat, ModelLoader};
use crate::types::FieldSpec;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Descriptive part of a model version, returned by the metadata endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub name: String,
    pub version: u32,
    pub format: ModelFormat,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the raw artifact, lowercase hex
    pub hash: String,
    /// Artifact size in bytes
    pub size: usize,
    pub model_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub input_schema: Vec<FieldSpec>,
    pub output_schema: Vec<FieldSpec>,
}

/// One deployed version of a servable. Never changes after creation.
pub struct ModelVersion {
    metadata: ModelMetadata,
    evaluator: Box<dyn Evaluator>,
}

impl ModelVersion {
    pub fn new(metadata: ModelMetadata, evaluator: Box<dyn Evaluator>) -> Self {
        Self { metadata, evaluator }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> u32 {
        self.metadata.version
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn input_schema(&self) -> &[FieldSpec] {
        &self.metadata.input_schema
    }

    pub fn output_schema(&self) -> &[FieldSpec] {
        &self.metadata.output_schema
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }
}

impl fmt::Debug for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelVersion")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A servable name with its deployed version numbers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServableSummary {
    pub name: String,
    pub versions: Vec<u32>,
}

/// Parsed artifact waiting to be registered
struct PreparedModel {
    hash: String,
    size: usize,
    loaded: LoadedModel,
}

/// Registry of every servable deployed since startup
pub struct ModelRegistry {
    servables: RwLock<HashMap<String, Vec<Arc<ModelVersion>>>>,
    loader: ModelLoader,
    deploy_timeout: Duration,
}

impl ModelRegistry {
    pub fn new(loader: ModelLoader, deploy_timeout: Duration) -> Self {
        Self {
            servables: RwLock::new(HashMap::new()),
            loader,
            deploy_timeout,
        }
    }

    /// Parse an artifact and register it as the next version of `name`.
    ///
    /// Parsing happens on a blocking worker without holding the registry
    /// lock; nothing is registered when it fails or runs out of time.
    pub async fn deploy(&self, name: &str, format: ModelFormat, artifact: Vec<u8>) -> Result<Arc<ModelVersion>> {
        validate_name(name)?;

        let loader = self.loader.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<PreparedModel> {
            let hash = format!("{:x}", Sha256::digest(&artifact));
            let loaded = loader.load(&artifact, format)?;
            Ok(PreparedModel {
                hash,
                size: artifact.len(),
                loaded,
            })
        });

        let prepared = match tokio::time::timeout(self.deploy_timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(ServingError::Internal(format!("deploy worker failed: {}", e)));
            }
            Err(_) => {
                return Err(ServingError::Timeout(format!(
                    "parsing '{}' took longer than {:?}",
                    name, self.deploy_timeout
                )));
            }
        };

        Ok(self.commit(name, format, prepared))
    }

    /// Register an already loaded model, bypassing artifact parsing
    #[cfg(test)]
    pub(crate) fn register(&self, name: &str, format: ModelFormat, loaded: LoadedModel) -> Arc<ModelVersion> {
        let prepared = PreparedModel {
            hash: String::new(),
            size: 0,
            loaded,
        };
        self.commit(name, format, prepared)
    }

    /// Assign the next version number and append, in one critical section
    fn commit(&self, name: &str, format: ModelFormat, prepared: PreparedModel) -> Arc<ModelVersion> {
        let PreparedModel { hash, size, loaded } = prepared;
        let mut servables = self.servables.write();
        let versions = servables.entry(name.to_string()).or_default();
        let version = versions.last().map_or(1, |v| v.version() + 1);

        let metadata = ModelMetadata {
            name: name.to_string(),
            version,
            format,
            created_at: Utc::now(),
            hash,
            size,
            model_type: loaded.model_type,
            function: loaded.function,
            input_schema: loaded.input_schema,
            output_schema: loaded.output_schema,
        };
        let model = Arc::new(ModelVersion::new(metadata, loaded.evaluator));
        versions.push(model.clone());

        info!(
            model = %name,
            version = version,
            format = %format,
            hash = %model.metadata().hash,
            "Model version registered"
        );
        model
    }

    /// Find a version; the latest when `version` is omitted
    pub fn resolve(&self, name: &str, version: Option<u32>) -> Result<Arc<ModelVersion>> {
        let servables = self.servables.read();
        let versions = servables
            .get(name)
            .ok_or_else(|| ServingError::NotFound(format!("model '{}'", name)))?;

        let found = match version {
            None => versions.last(),
            Some(v) => versions.iter().find(|m| m.version() == v),
        };
        let model = found.cloned().ok_or_else(|| match version {
            Some(v) => ServingError::NotFound(format!("model '{}' version {}", name, v)),
            None => ServingError::NotFound(format!("model '{}'", name)),
        })?;

        debug!(model = %name, version = model.version(), "Resolved model version");
        Ok(model)
    }

    pub fn get_metadata(&self, name: &str, version: Option<u32>) -> Result<ModelMetadata> {
        self.resolve(name, version).map(|m| m.metadata().clone())
    }

    /// Metadata of every version of a servable, ascending
    pub fn versions(&self, name: &str) -> Result<Vec<ModelMetadata>> {
        let servables = self.servables.read();
        servables
            .get(name)
            .filter(|v| !v.is_empty())
            .map(|versions| versions.iter().map(|m| m.metadata().clone()).collect())
            .ok_or_else(|| ServingError::NotFound(format!("model '{}'", name)))
    }

    /// Deployed version numbers of a servable, `None` if never deployed
    pub fn version_numbers(&self, name: &str) -> Option<Vec<u32>> {
        self.servables
            .read()
            .get(name)
            .map(|versions| versions.iter().map(|m| m.version()).collect())
    }

    /// Every servable, sorted by name
    pub fn list(&self) -> Vec<ServableSummary> {
        let servables = self.servables.read();
        let mut summaries: Vec<ServableSummary> = servables
            .iter()
            .map(|(name, versions)| ServableSummary {
                name: name.clone(),
                versions: versions.iter().map(|m| m.version()).collect(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

/// Servable names are non-empty and may not contain `/` or control characters
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ServingError::InvalidName("model name is empty".to_string()));
    }
    if name.contains('/') || name.chars().any(char::is_control) {
        return Err(ServingError::InvalidName(format!(
            "model name '{}' contains forbidden characters",
            name.escape_debug()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IRIS: &[u8] = include_bytes!("../tests/fixtures/iris_tree.pmml");

    fn registry() -> ModelRegistry {
        ModelRegistry::new(ModelLoader::default(), Duration::from_secs(30))
    }

    /// The iris tree behind a few megabytes of XML comment, slow to hash and parse
    fn padded_iris() -> Vec<u8> {
        let text = std::str::from_utf8(IRIS).unwrap();
        let (declaration, document) = text.split_once('\n').unwrap();
        format!("{}\n<!--{}-->\n{}", declaration, "x".repeat(4 << 20), document).into_bytes()
    }

    #[tokio::test]
    async fn test_deploy_assigns_increasing_versions() {
        let registry = registry();
        let v1 = registry.deploy("iris", ModelFormat::Pmml, IRIS.to_vec()).await.unwrap();
        let v2 = registry.deploy("iris", ModelFormat::Pmml, IRIS.to_vec()).await.unwrap();
        assert_eq!(v1.version(), 1);
        assert_eq!(v2.version(), 2);

        let latest = registry.resolve("iris", None).unwrap();
        assert_eq!(latest.version(), 2);
        assert_eq!(registry.resolve("iris", Some(1)).unwrap().version(), 1);
        assert_eq!(registry.version_numbers("iris"), Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_metadata() {
        let registry = registry();
        registry.deploy("iris", ModelFormat::Pmml, IRIS.to_vec()).await.unwrap();

        let metadata = registry.get_metadata("iris", None).unwrap();
        assert_eq!(metadata.format, ModelFormat::Pmml);
        assert_eq!(metadata.size, IRIS.len());
        assert_eq!(metadata.hash.len(), 64);
        assert_eq!(metadata.model_type, "TreeModel");

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["format"], "PMML");
        assert!(json.get("inputSchema").is_some());
        assert!(json.get("createdAt").is_some());
    }

    #[tokio::test]
    async fn test_failed_deploy_registers_nothing() {
        let registry = registry();
        let err = registry
            .deploy("broken", ModelFormat::Pmml, b"<PMML><oops".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::InvalidArtifact(_)));
        assert!(registry.version_numbers("broken").is_none());
        assert!(matches!(registry.resolve("broken", None), Err(ServingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_version() {
        let registry = registry();
        registry.deploy("iris", ModelFormat::Pmml, IRIS.to_vec()).await.unwrap();
        assert!(matches!(registry.resolve("iris", Some(9)), Err(ServingError::NotFound(_))));
        assert!(matches!(registry.versions("other"), Err(ServingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let registry = registry();
        registry.deploy("zeta", ModelFormat::Pmml, IRIS.to_vec()).await.unwrap();
        registry.deploy("alpha", ModelFormat::Pmml, IRIS.to_vec()).await.unwrap();
        let names: Vec<String> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_deploy_timeout_registers_nothing() {
        let registry = ModelRegistry::new(ModelLoader::default(), Duration::from_millis(1));
        let err = registry
            .deploy("slow", ModelFormat::Pmml, padded_iris())
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::Timeout(_)), "{:?}", err);
        assert!(registry.version_numbers("slow").is_none());

        // The abandoned parse may still finish; it must not register either.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(registry.version_numbers("slow").is_none());
        assert!(registry.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deploys_get_unique_versions() {
        const DEPLOYS: u32 = 16;
        let registry = Arc::new(registry());

        let tasks: Vec<_> = (0..DEPLOYS)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.deploy("iris", ModelFormat::Pmml, IRIS.to_vec()).await })
            })
            .collect();

        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap().unwrap().version());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=DEPLOYS).collect::<Vec<_>>());
        assert_eq!(registry.version_numbers("iris"), Some((1..=DEPLOYS).collect()));
        assert_eq!(registry.resolve("iris", None).unwrap().version(), DEPLOYS);
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("iris").is_ok());
        assert!(matches!(validate_name(""), Err(ServingError::InvalidName(_))));
        assert!(matches!(validate_name("a/b"), Err(ServingError::InvalidName(_))));
    }
}

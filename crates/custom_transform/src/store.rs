//! Transformation code store
//!
//! Fetches user transformation code from the config backend by version ID.
//! A version ID is immutable, so fetched code is cached for the configured
//! TTL through the single-flight cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{CustomTransformConfig, Event};
use credential_cache::{CacheError, CacheStatsSnapshot, CredentialCache};
use observability::metrics as pipeline_metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, instrument};
use url::Url;

use crate::runtime::{RuntimeExecutionError, UserTransformOutput, UserTransformRuntime};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid transformation backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Transformation not found at {url}. Received HTTP Error Response: {status}")]
    NotFound { url: String, status: u16 },
}

/// Code and metadata of one transformation version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationCode {
    #[serde(default)]
    pub version_id: String,

    #[serde(default)]
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_version: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub struct TransformationStore {
    client: reqwest::Client,
    endpoint: Url,
    cache: CredentialCache<String, Arc<TransformationCode>, StoreError>,
}

impl TransformationStore {
    pub fn new(backend_url: &str, ttl: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(StoreError::Client)?;
        Self::with_client(client, backend_url, ttl)
    }

    pub fn with_client(
        client: reqwest::Client,
        backend_url: &str,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        let endpoint = Url::parse(&format!(
            "{}/transformation/getByVersionId",
            backend_url.trim_end_matches('/')
        ))?;
        Ok(Self {
            client,
            endpoint,
            cache: CredentialCache::new("transformation_code", ttl),
        })
    }

    /// `None` when no backend is configured
    pub fn from_config(config: &CustomTransformConfig) -> Result<Option<Self>, StoreError> {
        config
            .backend_url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_secs(config.code_ttl_secs)))
            .transpose()
    }

    pub fn version_url(&self, version_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("versionId", version_id);
        url
    }

    /// Code for `version_id`, fetched at most once concurrently
    #[instrument(name = "transformation_code_get", skip(self))]
    pub async fn get(
        &self,
        version_id: &str,
    ) -> Result<Arc<TransformationCode>, CacheError<StoreError>> {
        let url = self.version_url(version_id);
        let client = self.client.clone();
        let version = version_id.to_string();
        self.cache
            .get(version_id.to_string(), move || fetch_code(client, url, version))
            .await
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }
}

async fn fetch_code(
    client: reqwest::Client,
    url: Url,
    version_id: String,
) -> Result<Arc<TransformationCode>, StoreError> {
    let started = Instant::now();
    info!(url = %url, "fetching transformation code");

    let outcome = async {
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| StoreError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::NotFound {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .json::<TransformationCode>()
            .await
            .map(Arc::new)
            .map_err(|source| StoreError::Request {
                url: url.to_string(),
                source,
            })
    }
    .await;

    pipeline_metrics::record_get_transformation_code(&version_id, outcome.is_ok(), started.elapsed());
    if let Err(e) = &outcome {
        error!(version_id = %version_id, error = %e, "transformation code fetch failed");
    }
    outcome
}

/// Evaluates fetched code; implemented by the sandbox hosting user code
#[trait_variant::make(CodeEngine: Send)]
pub trait LocalCodeEngine {
    async fn evaluate(
        &self,
        code: &TransformationCode,
        events: Vec<Event>,
        library_version_ids: &[String],
    ) -> Result<Vec<UserTransformOutput>, RuntimeExecutionError>;
}

/// Runtime that resolves code through a [`TransformationStore`] before
/// handing it to an engine
pub struct StoreBackedRuntime<E> {
    store: TransformationStore,
    engine: E,
}

impl<E> StoreBackedRuntime<E> {
    pub fn new(store: TransformationStore, engine: E) -> Self {
        Self { store, engine }
    }

    pub fn store(&self) -> &TransformationStore {
        &self.store
    }
}

impl<E> UserTransformRuntime for StoreBackedRuntime<E>
where
    E: CodeEngine + Sync,
{
    async fn run(
        &self,
        events: Vec<Event>,
        version_id: &str,
        library_version_ids: &[String],
    ) -> Result<Vec<UserTransformOutput>, RuntimeExecutionError> {
        let code = self
            .store
            .get(version_id)
            .await
            .map_err(|e| RuntimeExecutionError::new(e.to_string()))?;
        self.engine
            .evaluate(&code, events, library_version_ids)
            .await
    }
}

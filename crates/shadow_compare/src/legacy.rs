//! Legacy implementation target

use std::collections::BTreeMap;
use std::time::Duration;

use contracts::ShadowConfig;
use http::Method;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("invalid legacy url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("legacy request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("legacy request to {url} answered {status}")]
    Status { url: String, status: u16 },
}

/// The caller's request, as mirrored to the legacy implementation
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredRequest {
    pub method: Method,
    /// Route path, used for rule matching and metric tags
    pub path: String,
    pub query: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl MirroredRequest {
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: None,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: None,
            headers: BTreeMap::new(),
            body: Value::Null,
        }
    }

    /// Path plus query string
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{query}", self.path),
            _ => self.path.clone(),
        }
    }
}

#[trait_variant::make(LegacyTarget: Send)]
pub trait LocalLegacyTarget {
    /// Response body of the legacy implementation for `request`
    async fn fetch(&self, request: &MirroredRequest) -> Result<Value, LegacyError>;
}

/// Legacy implementation reached over HTTP
///
/// GET requests forward the caller's headers; every other method is sent
/// as a POST carrying the JSON body.
pub struct HttpLegacyTarget {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLegacyTarget {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LegacyError> {
        Url::parse(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(LegacyError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `None` when no legacy URL is configured
    pub fn from_config(config: &ShadowConfig) -> Result<Option<Self>, LegacyError> {
        config
            .legacy_url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_millis(config.legacy_timeout_ms)))
            .transpose()
    }

    pub fn target_url(&self, request: &MirroredRequest) -> Result<Url, LegacyError> {
        let url = request.url();
        Ok(Url::parse(&format!(
            "{}/{}",
            self.base_url,
            url.trim_start_matches('/')
        ))?)
    }
}

impl LegacyTarget for HttpLegacyTarget {
    #[instrument(name = "legacy_fetch", skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn fetch(&self, request: &MirroredRequest) -> Result<Value, LegacyError> {
        let url = self.target_url(request)?;
        let builder = if request.method == Method::GET {
            let mut builder = self.client.get(url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder
        } else {
            self.client.post(url.clone()).json(&request.body)
        };

        let request_error = |source| LegacyError::Request {
            url: url.to_string(),
            source,
        };
        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LegacyError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.json::<Value>().await.map_err(request_error)?;
        debug!(status = status.as_u16(), "legacy implementation answered");
        Ok(body)
    }
}

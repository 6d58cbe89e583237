//! Account token cache
//!
//! OAuth tokens for destination accounts, fetched from the config backend
//! and shared through the single-flight cache.

use std::time::Duration;

use contracts::CredentialsConfig;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::cache::{CacheError, CacheStatsSnapshot, CredentialCache};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TokenFetchError {
    #[error("invalid token backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("token request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("token request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Account token fetcher keyed by `accountId|workspaceId`
pub struct AccountTokenCache {
    client: reqwest::Client,
    backend_url: String,
    cache: CredentialCache<String, Value, TokenFetchError>,
}

impl AccountTokenCache {
    pub fn new(backend_url: &str, ttl: Duration) -> Result<Self, TokenFetchError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(TokenFetchError::Client)?;
        Self::with_client(client, backend_url, ttl)
    }

    pub fn with_client(
        client: reqwest::Client,
        backend_url: &str,
        ttl: Duration,
    ) -> Result<Self, TokenFetchError> {
        Url::parse(backend_url)?;
        Ok(Self {
            client,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            cache: CredentialCache::new("account_token", ttl),
        })
    }

    /// `None` when no backend is configured
    pub fn from_config(config: &CredentialsConfig) -> Result<Option<Self>, TokenFetchError> {
        config
            .backend_url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_secs(config.token_ttl_secs)))
            .transpose()
    }

    pub fn cache_key(account_id: &str, workspace_id: &str) -> String {
        format!("{account_id}|{workspace_id}")
    }

    pub fn token_url(&self, account_id: &str, workspace_id: &str) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "{}/dest/workspaces/{workspace_id}/accounts/{account_id}/token",
            self.backend_url
        ))
    }

    /// Token for the account, fetched at most once concurrently per key
    #[instrument(name = "account_token_get", skip(self))]
    pub async fn get_token(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Value, CacheError<TokenFetchError>> {
        let key = Self::cache_key(account_id, workspace_id);
        let url = self.token_url(account_id, workspace_id);
        let client = self.client.clone();
        self.cache
            .get(key, move || fetch_token(client, url))
            .await
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }
}

async fn fetch_token(
    client: reqwest::Client,
    url: Result<Url, url::ParseError>,
) -> Result<Value, TokenFetchError> {
    let url = url?;
    debug!(url = %url, "fetching account token");

    let response = client
        .post(url.clone())
        .send()
        .await
        .map_err(|source| TokenFetchError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(TokenFetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|source| TokenFetchError::Request {
            url: url.to_string(),
            source,
        })
}

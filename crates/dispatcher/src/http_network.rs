//! Built-in network handler over reqwest
//!
//! Used as the registry fallback for destinations that speak plain HTTP and
//! need no response reinterpretation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use contracts::{
    scalar_to_string, DispatchConfig, NetworkHandler, RawResponse, RequestDescriptor,
    RequestPayload, TransportError, TransportErrorKind,
};
use http::header::CONTENT_TYPE;
use reqwest::Method;
use tracing::{debug, instrument};
use url::Url;

use crate::error::DispatcherError;

pub struct HttpNetworkHandler {
    client: reqwest::Client,
}

impl HttpNetworkHandler {
    pub fn new(timeout: Duration) -> Result<Self, DispatcherError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DispatcherError::HttpClient)?;
        Ok(Self { client })
    }

    pub fn from_config(config: &DispatchConfig) -> Result<Self, DispatcherError> {
        Self::new(Duration::from_millis(config.proxy_timeout_ms))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: &RequestDescriptor) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|e| {
            TransportError::new(
                TransportErrorKind::InvalidRequest,
                format!("invalid method '{}': {e}", request.method),
            )
        })?;
        let url = Url::parse(&request.endpoint).map_err(|e| {
            TransportError::new(
                TransportErrorKind::InvalidRequest,
                format!("invalid endpoint '{}': {e}", request.endpoint),
            )
        })?;

        let params: Vec<(&str, String)> = request
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), scalar_to_string(v)))
            .collect();

        let mut builder = self.client.request(method, url).query(&params);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let builder = match request.body.payload() {
            RequestPayload::Json(body) => builder.json(&body),
            RequestPayload::Form(pairs) => builder.form(&pairs),
            RequestPayload::Xml(body) => {
                let has_content_type = request
                    .headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
                let builder = if has_content_type {
                    builder
                } else {
                    builder.header(CONTENT_TYPE, "application/xml")
                };
                builder.body(body)
            }
            RequestPayload::Empty => builder,
        };
        Ok(builder)
    }
}

#[async_trait]
impl NetworkHandler for HttpNetworkHandler {
    #[instrument(name = "http_network_proxy", skip(self, request), fields(method = %request.method, endpoint = %request.endpoint))]
    async fn proxy(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        let response = self.build(request)?.send().await.map_err(transport_error)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(transport_error)?;

        debug!(status, bytes = body.len(), "live call answered");
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn transport_error(e: reqwest::Error) -> TransportError {
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if e.is_connect() {
        TransportErrorKind::Connect
    } else if e.is_builder() {
        TransportErrorKind::InvalidRequest
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, e.to_string())
}

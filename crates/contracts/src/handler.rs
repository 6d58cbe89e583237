//! Destination capability traits
//!
//! A destination handler implements any subset of these. Absence of a
//! capability is a queryable fact on the registry record, never an error
//! raised from a missing method.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    BatchedRequest, Event, NormalizedResponse, ProxyOutput, RawResponse, RequestDescriptor,
    TransformError, TransformResult, TransportError,
};

/// Capability set of a destination handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Process,
    #[serde(rename = "processRouterDest")]
    RouterTransform,
    Batch,
    Proxy,
    FileUpload,
    Poll,
    FetchJobStatus,
    DeleteUsers,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Self::Process,
        Self::RouterTransform,
        Self::Batch,
        Self::Proxy,
        Self::FileUpload,
        Self::Poll,
        Self::FetchJobStatus,
        Self::DeleteUsers,
    ];

    /// Phrase used in "X doesn't support ..." messages
    pub fn description(&self) -> &'static str {
        match self {
            Self::Process => "processor transform",
            Self::RouterTransform => "router transform",
            Self::Batch => "batching",
            Self::Proxy => "proxy",
            Self::FileUpload | Self::Poll | Self::FetchJobStatus => "bulk upload",
            Self::DeleteUsers => "deletion of users",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Process => "process",
            Self::RouterTransform => "processRouterDest",
            Self::Batch => "batch",
            Self::Proxy => "proxy",
            Self::FileUpload => "fileUpload",
            Self::Poll => "poll",
            Self::FetchJobStatus => "fetchJobStatus",
            Self::DeleteUsers => "deleteUsers",
        };
        f.write_str(name)
    }
}

// ===== Transform Capabilities =====

/// Single-event transform
///
/// Returns zero, one or many destination payloads. A payload may carry its
/// own `statusCode` field.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, event: Event) -> Result<Vec<Value>, TransformError>;
}

/// Batch-aware transform for one destination-instance group
///
/// Each returned result carries the metadata of every contributing event.
#[async_trait]
pub trait RouterTransformer: Send + Sync {
    async fn process_router_dest(
        &self,
        events: Vec<Event>,
    ) -> Result<Vec<TransformResult>, TransformError>;
}

/// Pure request merging, no I/O
pub trait Batcher: Send + Sync {
    fn batch(&self, events: Vec<Event>) -> Result<Vec<BatchedRequest>, TransformError>;
}

// ===== Network Capability =====

/// Wire-protocol side of a destination
#[async_trait]
pub trait NetworkHandler: Send + Sync {
    /// Perform the live call
    async fn proxy(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError>;

    /// Normalize a raw response into the transport-independent shape
    fn process_response(&self, raw: &RawResponse) -> NormalizedResponse {
        NormalizedResponse::from_raw(raw)
    }

    /// Interpret a normalized response; may turn a 2xx into a failure or
    /// the reverse
    fn handle_response(
        &self,
        destination: &str,
        response: NormalizedResponse,
    ) -> Result<ProxyOutput, TransformError> {
        if response.is_success() {
            Ok(ProxyOutput {
                status: response.status,
                message: format!("[Generic Response Handler] Request for destination: {destination} Processed Successfully"),
                destination_response: Some(response.response),
                stat_tags: None,
            })
        } else {
            Err(TransformError::new(
                response.status,
                format!(
                    "[Generic Response Handler] Request failed for destination {destination} with status: {}",
                    response.status
                ),
            )
            .with_destination_response(response.response)
            .as_response_transform_failure())
        }
    }
}

// ===== Bulk Capabilities =====

#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn file_upload(&self, request: Value) -> Result<Value, TransformError>;
}

#[async_trait]
pub trait StatusPoller: Send + Sync {
    async fn poll(&self, request: Value) -> Result<Value, TransformError>;
}

/// Which job outcome list to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusKind {
    Fail,
    Warn,
}

impl JobStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Warn => "warn",
        }
    }
}

#[async_trait]
pub trait JobStatusFetcher: Send + Sync {
    async fn fetch_job_status(
        &self,
        request: Value,
        kind: JobStatusKind,
    ) -> Result<Value, TransformError>;
}

#[async_trait]
pub trait UserDeleter: Send + Sync {
    async fn delete_users(&self, request: Value) -> Result<Value, TransformError>;
}

// ===== Pipeline Hooks =====

/// Call shape a config expansion runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveMode {
    Processor,
    Router,
    Batch,
}

/// Expands templated destination config on a working copy, before the
/// handler sees it
pub trait DynamicConfigResolver: Send + Sync {
    fn resolve(&self, event: &mut Event, mode: ResolveMode) -> Result<(), TransformError>;
}

/// Opaque config-driven executor run alongside a handler for comparison
#[async_trait]
pub trait AlternateExecutor: Send + Sync {
    async fn execute(&self, destination: &str, event: Event) -> Result<Vec<Value>, TransformError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct EchoNetwork;

    #[async_trait]
    impl NetworkHandler for EchoNetwork {
        async fn proxy(&self, _request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
            Ok(RawResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: Bytes::from_static(b"{}"),
            })
        }
    }

    #[test]
    fn test_capability_wire_names() {
        assert_eq!(Capability::RouterTransform.to_string(), "processRouterDest");
        assert_eq!(
            serde_json::to_value(Capability::FetchJobStatus).unwrap(),
            json!("fetchJobStatus")
        );
        assert_eq!(Capability::DeleteUsers.description(), "deletion of users");
    }

    #[test]
    fn test_default_handle_response() {
        let ok = EchoNetwork
            .handle_response(
                "am",
                NormalizedResponse {
                    status: 201,
                    response: json!({"id": 1}),
                },
            )
            .unwrap();
        assert_eq!(ok.status, 201);
        assert_eq!(ok.destination_response, Some(json!({"id": 1})));

        let err = EchoNetwork
            .handle_response(
                "am",
                NormalizedResponse {
                    status: 429,
                    response: json!("slow down"),
                },
            )
            .unwrap_err();
        assert_eq!(err.status, 429);
        assert!(err.response_transform_failure);
        assert_eq!(err.destination_response, Some(json!("slow down")));
    }

    #[tokio::test]
    async fn test_default_process_response() {
        let request = RequestDescriptor {
            method: "POST".into(),
            endpoint: "http://localhost".into(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            body: Default::default(),
            extra: Default::default(),
        };
        let raw = EchoNetwork.proxy(&request).await.unwrap();
        let normalized = EchoNetwork.process_response(&raw);
        assert_eq!(normalized.status, 200);
        assert_eq!(normalized.response, json!({}));
    }
}

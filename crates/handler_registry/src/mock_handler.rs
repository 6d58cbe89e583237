//! Mock destination handler
//!
//! Implements every capability with deterministic output and injectable
//! failures, for unit and end-to-end tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use contracts::{
    chunk, BatchedRequest, Batcher, Event, FileUploader, JobStatusFetcher, JobStatusKind,
    NetworkHandler, Processor, RawResponse, RequestDescriptor, RouterTransformer, StatusPoller,
    TransformError, TransformResult, TransportError, TransportErrorKind, UserDeleter,
};
use serde_json::{json, Value};
use tracing::instrument;

/// Failure injection and response shaping
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// `process` fails with 400 for these message IDs
    pub fail_message_ids: Vec<String>,
    /// `process` panics for these message IDs
    pub panic_message_ids: Vec<String>,
    /// `process_router_dest` and `batch` fail for these destination IDs
    pub fail_destination_ids: Vec<String>,
    /// Router sub-batch size; zero means one batch per group
    pub router_chunk_size: usize,
    /// Status of the simulated live call
    pub proxy_status: u16,
    /// Body of the simulated live call
    pub proxy_body: String,
    /// Make the live call fail at the transport level
    pub proxy_error: Option<TransportErrorKind>,
    /// Artificial latency of every call
    pub delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_message_ids: Vec::new(),
            panic_message_ids: Vec::new(),
            fail_destination_ids: Vec::new(),
            router_chunk_size: 0,
            proxy_status: 200,
            proxy_body: r#"{"ok":true}"#.to_string(),
            proxy_error: None,
            delay: Duration::ZERO,
        }
    }
}

/// Mock handler with per-capability call counters
#[derive(Debug, Default)]
pub struct MockHandler {
    behavior: MockBehavior,
    process_calls: AtomicU64,
    router_calls: AtomicU64,
    batch_calls: AtomicU64,
    proxy_calls: AtomicU64,
    bulk_calls: AtomicU64,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub fn process_calls(&self) -> u64 {
        self.process_calls.load(Ordering::Relaxed)
    }

    pub fn router_calls(&self) -> u64 {
        self.router_calls.load(Ordering::Relaxed)
    }

    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::Relaxed)
    }

    pub fn proxy_calls(&self) -> u64 {
        self.proxy_calls.load(Ordering::Relaxed)
    }

    pub fn bulk_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::Relaxed)
    }

    async fn pause(&self) {
        if !self.behavior.delay.is_zero() {
            tokio::time::sleep(self.behavior.delay).await;
        }
    }

    fn group_fails(&self, events: &[Event]) -> Option<String> {
        events
            .iter()
            .map(|e| &e.destination.id)
            .find(|id| self.behavior.fail_destination_ids.contains(id))
            .cloned()
    }

    fn bulk_response(&self, operation: &str, request: Value) -> Result<Value, TransformError> {
        self.bulk_calls.fetch_add(1, Ordering::Relaxed);
        if request.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            let status = request
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(400);
            return Err(TransformError::new(status, format!("{operation} rejected")));
        }
        Ok(json!({ "operation": operation, "request": request }))
    }
}

/// Payload built by the mock `process`
///
/// `message.fanout` repeats the payload; `message.statusCode` is copied.
fn mock_payload(event: &Event) -> Vec<Value> {
    let mut payload = json!({
        "destinationId": event.destination.id,
        "messageId": event.metadata.message_id,
        "config": event.destination.config,
        "userId": event.message.get("userId").cloned().unwrap_or(Value::Null),
    });
    if let Some(status) = event.message.get("statusCode") {
        payload["statusCode"] = status.clone();
    }
    if let Some(query) = event.request.as_ref().map(|r| &r.query) {
        payload["query"] = json!(query);
    }
    let fanout = event
        .message
        .get("fanout")
        .and_then(Value::as_u64)
        .unwrap_or(1) as usize;
    vec![payload; fanout]
}

#[async_trait]
impl Processor for MockHandler {
    #[instrument(name = "mock_process", skip(self, event), fields(message_id = %event.metadata.message_id))]
    async fn process(&self, event: Event) -> Result<Vec<Value>, TransformError> {
        self.process_calls.fetch_add(1, Ordering::Relaxed);
        self.pause().await;

        let id = &event.metadata.message_id;
        if self.behavior.panic_message_ids.contains(id) {
            panic!("mock handler panicked for {id}");
        }
        if self.behavior.fail_message_ids.contains(id) {
            return Err(TransformError::bad_request(format!("invalid event {id}")));
        }
        Ok(mock_payload(&event))
    }
}

#[async_trait]
impl RouterTransformer for MockHandler {
    async fn process_router_dest(
        &self,
        events: Vec<Event>,
    ) -> Result<Vec<TransformResult>, TransformError> {
        self.router_calls.fetch_add(1, Ordering::Relaxed);
        self.pause().await;

        if let Some(id) = self.group_fails(&events) {
            return Err(TransformError::bad_request(format!(
                "cannot build batch for {id}"
            )));
        }
        let Some(destination) = events.first().map(|e| e.destination.clone()) else {
            return Ok(Vec::new());
        };
        let size = match self.behavior.router_chunk_size {
            0 => events.len(),
            n => n,
        };
        let results = chunk(events, size)
            .into_iter()
            .map(|sub_batch| {
                let ids: Vec<_> = sub_batch
                    .iter()
                    .map(|e| e.metadata.message_id.clone())
                    .collect();
                let metadata = sub_batch.into_iter().map(|e| e.metadata).collect();
                TransformResult::batched(json!({ "batch": ids }), metadata, destination.clone())
            })
            .collect();
        Ok(results)
    }
}

impl Batcher for MockHandler {
    fn batch(&self, events: Vec<Event>) -> Result<Vec<BatchedRequest>, TransformError> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(id) = self.group_fails(&events) {
            return Err(TransformError::upstream(format!("cannot merge {id}")));
        }
        let ids: Vec<_> = events
            .iter()
            .map(|e| e.metadata.message_id.clone())
            .collect();
        let config = events.first().map(|e| e.destination.config.clone());
        Ok(vec![BatchedRequest {
            batched_request: json!({ "batch": ids, "config": config }),
            metadata: events.into_iter().map(|e| e.metadata).collect(),
            extra: Default::default(),
        }])
    }
}

#[async_trait]
impl NetworkHandler for MockHandler {
    async fn proxy(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        self.proxy_calls.fetch_add(1, Ordering::Relaxed);
        self.pause().await;

        if let Some(kind) = self.behavior.proxy_error {
            return Err(TransportError::new(
                kind,
                format!("mock transport failure for {}", request.endpoint),
            ));
        }
        Ok(RawResponse {
            status: self.behavior.proxy_status,
            headers: BTreeMap::new(),
            body: Bytes::from(self.behavior.proxy_body.clone()),
        })
    }
}

#[async_trait]
impl FileUploader for MockHandler {
    async fn file_upload(&self, request: Value) -> Result<Value, TransformError> {
        self.bulk_response("fileUpload", request)
    }
}

#[async_trait]
impl StatusPoller for MockHandler {
    async fn poll(&self, request: Value) -> Result<Value, TransformError> {
        self.bulk_response("poll", request)
    }
}

#[async_trait]
impl JobStatusFetcher for MockHandler {
    async fn fetch_job_status(
        &self,
        request: Value,
        kind: JobStatusKind,
    ) -> Result<Value, TransformError> {
        self.bulk_response(&format!("fetchJobStatus:{}", kind.as_str()), request)
    }
}

#[async_trait]
impl UserDeleter for MockHandler {
    async fn delete_users(&self, request: Value) -> Result<Value, TransformError> {
        self.bulk_response("deleteUsers", request)
    }
}

//! Bulk operations
//!
//! `fileUpload`, `poll`, `fetchJobStatus` and `deleteUsers` pass an opaque
//! request straight to the destination's handler. Handler failures are
//! answered in-band as `{statusCode, error}`; a missing handler or
//! capability fails the call.

use std::sync::Arc;

use contracts::{JobStatusKind, PipelineError, TransformError};
use futures::future::join_all;
use handler_registry::HandlerRegistry;
use serde_json::{json, Value};
use tracing::{instrument, warn};

const DEFAULT_ERROR: &str = "Error occurred while processing payload.";
const DEFAULT_DELETE_ERROR: &str = "Error occurred while deleting user";

#[derive(Clone)]
pub struct BulkDispatch {
    registry: Arc<HandlerRegistry>,
}

impl BulkDispatch {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    #[instrument(name = "bulk_file_upload", skip(self, request))]
    pub async fn file_upload(&self, destination: &str, request: Value) -> Result<Value, PipelineError> {
        let uploader = self.registry.file_uploader(&destination.to_lowercase())?;
        Ok(in_band(destination, uploader.file_upload(request).await, DEFAULT_ERROR))
    }

    #[instrument(name = "bulk_poll", skip(self, request))]
    pub async fn poll(&self, destination: &str, request: Value) -> Result<Value, PipelineError> {
        let poller = self.registry.poller(&destination.to_lowercase())?;
        Ok(in_band(destination, poller.poll(request).await, DEFAULT_ERROR))
    }

    #[instrument(name = "bulk_fetch_job_status", skip(self, request))]
    pub async fn fetch_job_status(
        &self,
        destination: &str,
        request: Value,
        kind: JobStatusKind,
    ) -> Result<Value, PipelineError> {
        let fetcher = self.registry.job_status(&destination.to_lowercase())?;
        Ok(in_band(
            destination,
            fetcher.fetch_job_status(request, kind).await,
            DEFAULT_ERROR,
        ))
    }

    /// Run every deletion request concurrently
    ///
    /// Each request names its destination in `destType`. Responses keep
    /// request order; requests whose handler returns `null` are omitted.
    ///
    /// # Errors
    /// `Validation` when a request lacks `destType`; routing errors when
    /// any named destination cannot delete users. Nothing runs in that case.
    #[instrument(name = "bulk_delete_users", skip(self, requests), fields(requests = requests.len()))]
    pub async fn delete_users(&self, requests: Vec<Value>) -> Result<Vec<Value>, PipelineError> {
        let mut calls = Vec::with_capacity(requests.len());
        for request in requests {
            let destination = request
                .get("destType")
                .and_then(Value::as_str)
                .map(str::to_lowercase)
                .ok_or_else(|| PipelineError::validation("destType is required for user deletion"))?;
            let deleter = self.registry.user_deleter(&destination)?;
            calls.push(async move {
                let outcome = deleter.delete_users(request).await;
                in_band(&destination, outcome, DEFAULT_DELETE_ERROR)
            });
        }

        Ok(join_all(calls)
            .await
            .into_iter()
            .filter(|response| !response.is_null())
            .collect())
    }
}

fn in_band(destination: &str, outcome: Result<Value, TransformError>, fallback: &str) -> Value {
    match outcome {
        Ok(response) => response,
        Err(e) => {
            warn!(destination = %destination, status = e.status, error = %e, "bulk operation failed");
            let message = if e.message.is_empty() {
                fallback.to_string()
            } else {
                e.message
            };
            json!({ "statusCode": e.status, "error": message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handler_registry::{DestinationHandler, MockHandler};

    fn bulk() -> (Arc<MockHandler>, BulkDispatch) {
        let mock = Arc::new(MockHandler::new());
        let registry = HandlerRegistry::builder()
            .register(
                DestinationHandler::builder("marketo_bulk_upload")
                    .file_uploader(mock.clone())
                    .poller(mock.clone())
                    .job_status(mock.clone())
                    .build(),
            )
            .register(
                DestinationHandler::builder("am")
                    .user_deleter(mock.clone())
                    .build(),
            )
            .register(DestinationHandler::builder("ga").build())
            .build();
        (mock, BulkDispatch::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_bulk_upload_operations_use_lowercased_names() {
        let (mock, bulk) = bulk();

        let uploaded = bulk
            .file_upload("MARKETO_BULK_UPLOAD", json!({"input": []}))
            .await
            .unwrap();
        assert_eq!(uploaded["operation"], json!("fileUpload"));

        let polled = bulk
            .poll("marketo_bulk_upload", json!({"importId": "1"}))
            .await
            .unwrap();
        assert_eq!(polled["operation"], json!("poll"));

        let warn = bulk
            .fetch_job_status("marketo_bulk_upload", json!({}), JobStatusKind::Warn)
            .await
            .unwrap();
        assert_eq!(warn["operation"], json!("fetchJobStatus:warn"));
        assert_eq!(mock.bulk_calls(), 3);
    }

    #[tokio::test]
    async fn test_handler_failure_is_answered_in_band() {
        let (_, bulk) = bulk();

        let response = bulk
            .file_upload("marketo_bulk_upload", json!({"fail": true, "status": 429}))
            .await
            .unwrap();
        assert_eq!(response, json!({"statusCode": 429, "error": "fileUpload rejected"}));

        let err = bulk.poll("ga", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "ga doesn't support bulk upload");
    }

    #[tokio::test]
    async fn test_delete_users_collects_every_response() {
        let (mock, bulk) = bulk();

        let responses = bulk
            .delete_users(vec![
                json!({"destType": "AM", "userAttributes": [{"userId": "u1"}]}),
                json!({"destType": "am", "fail": true}),
            ])
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["operation"], json!("deleteUsers"));
        assert_eq!(responses[1]["statusCode"], json!(400));
        assert_eq!(mock.bulk_calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_users_rejects_unsupported_destinations_up_front() {
        let (mock, bulk) = bulk();

        let err = bulk
            .delete_users(vec![json!({"destType": "am"}), json!({"destType": "ga"})])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "ga doesn't support deletion of users");
        assert_eq!(mock.bulk_calls(), 0);

        let err = bulk.delete_users(vec![json!({})]).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }
}

//! User code runtime interface
//!
//! The runtime that actually evaluates user transformation code lives
//! outside this crate. It receives one group of events per call.

use contracts::{Event, EventMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One item returned by the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTransformOutput {
    /// Transformed event; must be a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformed_event: Option<Value>,

    /// Metadata of the event this item came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,

    /// Per-item error raised by the user code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UserTransformOutput {
    pub fn transformed(event: Value, metadata: EventMetadata) -> Self {
        Self {
            transformed_event: Some(event),
            metadata: Some(metadata),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, metadata: Option<EventMetadata>) -> Self {
        Self {
            transformed_event: None,
            metadata,
            error: Some(error.into()),
        }
    }
}

/// Whole-group failure of the runtime
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeExecutionError {
    pub message: String,
}

impl RuntimeExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Evaluates a versioned user transformation over one group of events
#[trait_variant::make(UserTransformRuntime: Send)]
pub trait LocalUserTransformRuntime {
    /// Run transformation `version_id` with the given library versions
    ///
    /// # Errors
    /// `RuntimeExecutionError` when the code fails for the group as a
    /// whole; per-event failures are reported as items.
    async fn run(
        &self,
        events: Vec<Event>,
        version_id: &str,
        library_version_ids: &[String],
    ) -> Result<Vec<UserTransformOutput>, RuntimeExecutionError>;
}

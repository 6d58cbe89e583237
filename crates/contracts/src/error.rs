//! Layered error definitions
//!
//! Categorized by blast radius:
//! - call-level (`PipelineError`): the whole request fails with one status
//! - item-level (`TransformError`): isolated to one event or one group and
//!   rendered as an `ErrorEnvelope`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Capability;

/// Metric tags attached to error records
pub type StatTags = BTreeMap<String, String>;

/// Pipeline stage an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformerStage {
    /// Building a destination payload from an event
    #[serde(rename = "transform")]
    Transform,
    /// Performing a live call or interpreting its response
    #[serde(rename = "responseTransform")]
    ResponseTransform,
    /// Running user supplied transformation code
    #[serde(rename = "userTransform")]
    UserTransform,
}

impl TransformerStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transform => "transform",
            Self::ResponseTransform => "responseTransform",
            Self::UserTransform => "userTransform",
        }
    }
}

/// Call-level error: fails the whole dispatch call
#[derive(Debug, Error)]
pub enum PipelineError {
    // ===== Input Errors =====
    /// Malformed input batch
    #[error("{message}")]
    Validation { message: String },

    // ===== Routing Errors =====
    /// No handler registered under the given name
    #[error("no handler registered for destination '{destination}'")]
    NotFound { destination: String },

    /// Handler exists but lacks the requested capability
    #[error("{destination} doesn't support {}", capability.description())]
    UnsupportedOperation {
        destination: String,
        capability: Capability,
    },

    // ===== Dispatch Errors =====
    /// One or more batch groups could not be merged
    #[error("batching failed: {}", errors.join("; "))]
    BatchFailed { errors: Vec<String> },

    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create malformed batch error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create the error raised for an empty or missing batch
    pub fn empty_batch() -> Self {
        Self::validation("Event is missing or in inappropriate format")
    }

    /// Create unknown destination error
    pub fn not_found(destination: impl Into<String>) -> Self {
        Self::NotFound {
            destination: destination.into(),
        }
    }

    /// Create missing capability error
    pub fn unsupported(destination: impl Into<String>, capability: Capability) -> Self {
        Self::UnsupportedOperation {
            destination: destination.into(),
            capability,
        }
    }

    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// HTTP-analog status for the caller
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } | Self::UnsupportedOperation { .. } => 404,
            Self::BatchFailed { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigValidation { .. }
            | Self::Io(_) => 500,
        }
    }

    /// Routing failures must not be retried by the caller
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::UnsupportedOperation { .. }
        )
    }
}

/// Item-level error raised by a handler for one event or one group
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransformError {
    /// HTTP-analog status
    pub status: u16,
    /// Human readable message
    pub message: String,
    /// Body returned by the destination, when the error came from a live call
    pub destination_response: Option<Value>,
    /// Set when a response handler rejected a response it received
    pub response_transform_failure: bool,
    /// Extra metric tags supplied by the handler
    pub stat_tags: StatTags,
}

impl TransformError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            destination_response: None,
            response_transform_failure: false,
            stat_tags: StatTags::new(),
        }
    }

    /// Invalid or unmappable input event
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// A dependency such as a credential issuer could not be reached
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn with_destination_response(mut self, response: Value) -> Self {
        self.destination_response = Some(response);
        self
    }

    /// Mark as raised while interpreting a destination response
    pub fn as_response_transform_failure(mut self) -> Self {
        self.response_transform_failure = true;
        self
    }

    pub fn with_stat_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.stat_tags.insert(key.into(), value.into());
        self
    }
}

/// Uniform, caller-visible rendering of an item-level error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_response: Option<Value>,
    pub stat_tags: StatTags,
}

impl ErrorEnvelope {
    /// Render an error for `destination` tagged with the stage it came from
    pub fn from_error(error: &TransformError, destination: &str, stage: TransformerStage) -> Self {
        let mut stat_tags = error.stat_tags.clone();
        stat_tags.insert("destType".to_string(), destination.to_uppercase());
        stat_tags.insert("stage".to_string(), stage.as_str().to_string());
        stat_tags
            .entry("scope".to_string())
            .or_insert_with(|| default_scope(error.status).to_string());

        let message = if error.message.is_empty() {
            "Error occurred while processing payload.".to_string()
        } else {
            error.message.clone()
        };

        Self {
            status: error.status,
            message,
            destination_response: error.destination_response.clone(),
            stat_tags,
        }
    }
}

fn default_scope(status: u16) -> &'static str {
    match status {
        429 | 500..=599 => "retryable",
        400..=499 => "aborted",
        _ => "exception",
    }
}

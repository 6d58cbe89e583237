//! TransformResult - dispatch output
//!
//! One event may yield zero, one or many results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Destination, ErrorEnvelope, EventMetadata, StatTags};

/// One caller-visible result record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResult {
    /// Destination payload or batched request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Metadata of the contributing event(s)
    pub metadata: ResultMetadata,

    /// HTTP-analog status
    pub status_code: u16,

    /// Human readable failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Metric tags for failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_tags: Option<StatTags>,

    /// Whether `output` merges several events (router delivery)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batched: Option<bool>,

    /// Destination instance the batch targets (router delivery)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
}

impl TransformResult {
    /// Successful single-event result
    pub fn success(output: Value, metadata: impl Into<ResultMetadata>) -> Self {
        Self {
            output: Some(output),
            metadata: metadata.into(),
            status_code: 200,
            error: None,
            stat_tags: None,
            batched: None,
            destination: None,
        }
    }

    /// Failed result with a bare status and message
    pub fn failure(
        status_code: u16,
        error: impl Into<String>,
        metadata: impl Into<ResultMetadata>,
    ) -> Self {
        Self {
            output: None,
            metadata: metadata.into(),
            status_code,
            error: Some(error.into()),
            stat_tags: None,
            batched: None,
            destination: None,
        }
    }

    /// Failed result rendered from an error envelope
    pub fn from_envelope(envelope: ErrorEnvelope, metadata: impl Into<ResultMetadata>) -> Self {
        Self {
            output: None,
            metadata: metadata.into(),
            status_code: envelope.status,
            error: Some(envelope.message),
            stat_tags: Some(envelope.stat_tags),
            batched: None,
            destination: None,
        }
    }

    /// Successful router delivery covering several events
    pub fn batched(
        output: Value,
        metadata: Vec<EventMetadata>,
        destination: Destination,
    ) -> Self {
        Self {
            output: Some(output),
            metadata: ResultMetadata::Batch(metadata),
            status_code: 200,
            error: None,
            stat_tags: None,
            batched: Some(true),
            destination: Some(destination),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) && self.error.is_none()
    }

    /// Message IDs of every contributing event
    pub fn message_ids(&self) -> Vec<&str> {
        match &self.metadata {
            ResultMetadata::Single(m) => vec![m.message_id.as_str()],
            ResultMetadata::Batch(list) => list.iter().map(|m| m.message_id.as_str()).collect(),
            ResultMetadata::Common(c) => c.message_ids.iter().map(String::as_str).collect(),
        }
    }
}

/// Metadata echoed into a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultMetadata {
    /// Every contributing event of a batch
    Batch(Vec<EventMetadata>),
    /// Group-level metadata when per-item metadata is unavailable
    Common(CommonMetadata),
    /// The originating event
    Single(EventMetadata),
}

impl From<EventMetadata> for ResultMetadata {
    fn from(metadata: EventMetadata) -> Self {
        Self::Single(metadata)
    }
}

impl From<Vec<EventMetadata>> for ResultMetadata {
    fn from(metadata: Vec<EventMetadata>) -> Self {
        Self::Batch(metadata)
    }
}

impl From<CommonMetadata> for ResultMetadata {
    fn from(metadata: CommonMetadata) -> Self {
        Self::Common(metadata)
    }
}

/// Metadata shared by a whole group of events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonMetadata {
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub message_ids: Vec<String>,
}

impl CommonMetadata {
    /// Build from the first event of a group plus every member's message ID
    pub fn from_group<'a>(members: impl IntoIterator<Item = &'a EventMetadata>) -> Self {
        let mut members = members.into_iter().peekable();
        let mut common = members
            .peek()
            .map(|first| Self {
                source_id: first.source_id.clone(),
                destination_id: first.destination_id.clone(),
                destination_type: first.destination_type.clone(),
                message_ids: Vec::new(),
            })
            .unwrap_or_default();
        common.message_ids = members.map(|m| m.message_id.clone()).collect();
        common
    }
}

/// Merged request produced by the `batch` capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchedRequest {
    /// Destination-specific merged request
    pub batched_request: Value,

    /// Metadata of every merged event
    #[serde(default)]
    pub metadata: Vec<EventMetadata>,

    /// Remaining fields, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Drop null-valued object keys, recursively
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(id: &str) -> EventMetadata {
        EventMetadata {
            source_id: "src".into(),
            destination_id: "dst".into(),
            destination_type: "GA".into(),
            message_id: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_success_serializes_wire_names() {
        let result = TransformResult::success(json!({"a": 1}), meta("m1"));
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["statusCode"], json!(200));
        assert_eq!(value["metadata"]["messageId"], json!("m1"));
        assert!(value.get("error").is_none());
        assert!(value.get("statTags").is_none());
    }

    #[test]
    fn test_common_metadata_collects_message_ids() {
        let members = [meta("m1"), meta("m2")];
        let common = CommonMetadata::from_group(members.iter());

        assert_eq!(common.source_id, "src");
        assert_eq!(common.message_ids, vec!["m1", "m2"]);

        let result = TransformResult::failure(400, "boom", common);
        assert_eq!(result.message_ids(), vec!["m1", "m2"]);
        assert!(!result.is_success());
    }

    #[test]
    fn test_batch_metadata_round_trips_as_array() {
        let result = TransformResult::batched(
            json!({"body": []}),
            vec![meta("a"), meta("b")],
            Destination::default(),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert!(value["metadata"].is_array());

        let back: TransformResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.message_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_strip_nulls_is_recursive() {
        let stripped = strip_nulls(json!({"a": null, "b": {"c": null, "d": [ {"e": null} ]}}));
        assert_eq!(stripped, json!({"b": {"d": [{}]}}));
    }
}

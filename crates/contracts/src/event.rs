//! Event - dispatch input
//!
//! One analytics record plus the destination instance it is bound for.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One inbound record
///
/// Immutable as received. Dispatch paths clone a working copy before
/// config expansion or handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque source payload
    pub message: Value,

    /// Destination instance the event is bound for
    pub destination: Destination,

    /// Routing metadata echoed into every result
    pub metadata: EventMetadata,

    /// User transformation libraries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<Library>,

    /// Caller request context, attached by processor dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestContext>,
}

impl Event {
    /// `message.anonymousId`, if present and a string
    pub fn anonymous_id(&self) -> Option<&str> {
        self.message.get("anonymousId").and_then(Value::as_str)
    }
}

/// Destination instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination instance ID
    #[serde(rename = "ID", default)]
    pub id: String,

    /// Opaque key/value configuration
    #[serde(rename = "Config", default)]
    pub config: Map<String, Value>,

    /// Attached user transformations
    #[serde(
        rename = "Transformations",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub transformations: Vec<TransformationRef>,

    /// Remaining fields, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Destination {
    /// Version of the first attached transformation, if any
    pub fn transformation_version_id(&self) -> Option<&str> {
        self.transformations
            .first()
            .and_then(|t| t.version_id.as_deref())
            .filter(|v| !v.is_empty())
    }
}

/// Reference to a versioned user transformation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformationRef {
    #[serde(rename = "VersionID", default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// User transformation library reference
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Library {
    #[serde(rename = "VersionID", default)]
    pub version_id: String,
}

/// Routing metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default)]
    pub source_id: String,

    #[serde(default)]
    pub destination_id: String,

    #[serde(default)]
    pub destination_type: String,

    #[serde(default)]
    pub message_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rudder_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,

    /// Remaining fields, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Caller request context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Query parameters of the inbound call
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

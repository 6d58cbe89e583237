//! Proxy wire types
//!
//! A pre-built request descriptor, the raw response of the live call, its
//! transport-independent normalization and the envelope returned to callers.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{ErrorEnvelope, StatTags};

/// Already-constructed destination request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    /// HTTP method, upper case
    #[serde(default = "default_method")]
    pub method: String,

    /// Absolute URL
    pub endpoint: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Query parameters
    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    #[serde(default)]
    pub body: RequestBody,

    /// Remaining fields, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Body variants; at most one is expected to be non-empty
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(rename = "JSON", default)]
    pub json: Map<String, Value>,

    #[serde(rename = "JSON_ARRAY", default)]
    pub json_array: Map<String, Value>,

    #[serde(rename = "XML", default)]
    pub xml: Map<String, Value>,

    #[serde(rename = "FORM", default)]
    pub form: Map<String, Value>,
}

/// Encoded request payload
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Json(Value),
    Form(Vec<(String, String)>),
    Xml(String),
    Empty,
}

impl RequestBody {
    /// Pick the first non-empty body variant
    pub fn payload(&self) -> RequestPayload {
        if !self.json.is_empty() {
            return RequestPayload::Json(Value::Object(self.json.clone()));
        }
        if let Some(batch) = self.json_array.get("batch") {
            let parsed = match batch {
                Value::String(raw) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                other => other.clone(),
            };
            return RequestPayload::Json(parsed);
        }
        if let Some(payload) = self.xml.get("payload").and_then(Value::as_str) {
            return RequestPayload::Xml(payload.to_string());
        }
        if !self.form.is_empty() {
            let pairs = self
                .form
                .iter()
                .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                .collect();
            return RequestPayload::Form(pairs);
        }
        RequestPayload::Empty
    }
}

/// Render a JSON scalar the way it appears in a query string or form
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Response of a live call, as received
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Transport-level failure of a live call
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportErrorKind {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed")]
    Connect,
    #[error("invalid request")]
    InvalidRequest,
    #[error("transport error")]
    Other,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// HTTP-analog status reported for this failure
    pub fn status(&self) -> u16 {
        match self.kind {
            TransportErrorKind::Timeout => 504,
            TransportErrorKind::Connect => 502,
            TransportErrorKind::InvalidRequest => 400,
            TransportErrorKind::Other => 500,
        }
    }
}

/// Transport-independent view of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub status: u16,
    /// Parsed JSON body, the raw text when not JSON, `""` when empty
    pub response: Value,
}

impl NormalizedResponse {
    pub fn from_raw(raw: &RawResponse) -> Self {
        let response = if raw.body.is_empty() {
            Value::String(String::new())
        } else {
            serde_json::from_slice(&raw.body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&raw.body).into_owned())
            })
        };
        Self {
            status: raw.status,
            response,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Body of a proxy envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyOutput {
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_tags: Option<StatTags>,
}

impl From<ErrorEnvelope> for ProxyOutput {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self {
            status: envelope.status,
            message: envelope.message,
            destination_response: envelope.destination_response,
            stat_tags: Some(envelope.stat_tags),
        }
    }
}

/// Exactly one per proxy call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEnvelope {
    pub output: ProxyOutput,
}

impl ProxyEnvelope {
    /// Outer transport status mirrors the normalized response status
    pub fn status(&self) -> u16 {
        self.output.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.output.status)
    }
}

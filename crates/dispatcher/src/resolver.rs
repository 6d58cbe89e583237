//! Dynamic destination config
//!
//! Destination `Config` values may reference the event they are applied to:
//!
//! ```text
//! "apiKey": "{{ message.context.apiKey || \"fallback\" }}"
//! ```
//!
//! A value that is exactly one template is replaced by the referenced value
//! (any JSON type), or by the quoted default when the reference is missing.
//! A template without a default whose reference is missing is left as is.

use contracts::{DynamicConfigResolver, Event, ResolveMode, TransformError};
use serde_json::Value;

/// Leaves the event untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

impl DynamicConfigResolver for PassthroughResolver {
    fn resolve(&self, _event: &mut Event, _mode: ResolveMode) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Expands `{{ message.path || "default" }}` templates in `destination.Config`
///
/// Every mode resolves against the event's own message, so router and batch
/// groups see per-event values.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResolver;

impl DynamicConfigResolver for TemplateResolver {
    fn resolve(&self, event: &mut Event, _mode: ResolveMode) -> Result<(), TransformError> {
        let mut config = std::mem::take(&mut event.destination.config);
        for value in config.values_mut() {
            expand(value, &event.message)?;
        }
        event.destination.config = config;
        Ok(())
    }
}

fn expand(value: &mut Value, message: &Value) -> Result<(), TransformError> {
    match value {
        Value::String(raw) => {
            if let Some(template) = Template::parse(raw)? {
                if let Some(resolved) = template.evaluate(message) {
                    *value = resolved;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                expand(item, message)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                expand(item, message)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
struct Template<'a> {
    path: Vec<&'a str>,
    default: Option<&'a str>,
}

impl<'a> Template<'a> {
    /// `None` when `raw` is not a template
    fn parse(raw: &'a str) -> Result<Option<Self>, TransformError> {
        let Some(inner) = raw
            .trim()
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
        else {
            return Ok(None);
        };

        let (reference, default) = match inner.split_once("||") {
            Some((reference, default)) => (reference.trim(), Some(unquote(default.trim())?)),
            None => (inner.trim(), None),
        };

        // only message-rooted references are expanded
        let Some(path) = reference.strip_prefix("message.") else {
            return Ok(None);
        };
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(TransformError::bad_request(format!(
                "invalid dynamic config reference '{reference}'"
            )));
        }

        Ok(Some(Self {
            path: path.split('.').collect(),
            default,
        }))
    }

    fn evaluate(&self, message: &Value) -> Option<Value> {
        let found = self
            .path
            .iter()
            .try_fold(message, |current, key| match current {
                Value::Object(map) => map.get(*key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
            .filter(|v| !v.is_null());

        match found {
            Some(value) => Some(value.clone()),
            None => self.default.map(|d| Value::String(d.to_string())),
        }
    }
}

fn unquote(raw: &str) -> Result<&str, TransformError> {
    ['"', '\'']
        .iter()
        .find_map(|q| raw.strip_prefix(*q).and_then(|r| r.strip_suffix(*q)))
        .ok_or_else(|| {
            TransformError::bad_request(format!("dynamic config default must be quoted: {raw}"))
        })
}

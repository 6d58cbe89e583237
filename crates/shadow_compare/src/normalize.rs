//! Per-route payload normalization
//!
//! Both sides of a comparison go through the same steps: strip the fields
//! registered for the route from every result item, then sort items by
//! message ID so ordering differences never register as mismatches.

use std::cmp::Ordering;

use contracts::{ShadowConfig, ShadowRule};
use serde_json::Value;

const CUSTOM_TRANSFORM_ROUTE: &str = "/customTransform";

/// Fields that differ between implementations by construction
pub fn builtin_rules() -> Vec<ShadowRule> {
    let rule = |route: &str, strip: &[&str]| ShadowRule {
        route: route.to_string(),
        strip: strip.iter().map(|s| s.to_string()).collect(),
    };
    vec![
        rule("/v0/ga", &["output.params.qt"]),
        rule("/v0/facebook_pixel", &["output.body.FORM.data"]),
        rule(
            "/v0/snowflake",
            &[
                "output.metadata.receivedAt",
                "output.data.ID",
                "output.data.RECEIVED_AT",
            ],
        ),
        rule("/v0/sfmc", &["output.headers.Authorization"]),
        rule("/v0/salesforce", &["output.headers.Authorization"]),
        rule(
            CUSTOM_TRANSFORM_ROUTE,
            &[
                "output.header.Authorization",
                "output.userId",
                "output.event_time",
            ],
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: Vec<ShadowRule>,
    include_routes: Vec<String>,
    exclude_routes: Vec<String>,
}

impl Normalizer {
    /// Built-in rules followed by the configured ones
    pub fn from_config(config: &ShadowConfig) -> Self {
        let mut rules = builtin_rules();
        rules.extend(config.rules.iter().cloned());
        Self {
            rules,
            include_routes: config.include_routes.clone(),
            exclude_routes: config.exclude_routes.clone(),
        }
    }

    /// Excluded routes win over included ones
    pub fn is_compared(&self, path: &str) -> bool {
        if self.exclude_routes.iter().any(|r| path.contains(r.as_str())) {
            return false;
        }
        self.include_routes.iter().any(|r| path.contains(r.as_str()))
    }

    pub fn normalize(&self, path: &str, payload: Value) -> Value {
        let Value::Array(mut items) = payload else {
            return payload;
        };

        for rule in self.rules.iter().filter(|r| path.contains(r.route.as_str())) {
            for item in items.iter_mut() {
                for field in &rule.strip {
                    remove_path(item, field);
                }
            }
        }

        if !path.contains("/v0/sources") && !path.contains("/v0/destinations") {
            items.sort_by(|a, b| compare_at(a, b, "/metadata/messageId"));
        }
        if path.contains(CUSTOM_TRANSFORM_ROUTE) {
            items.sort_by(|a, b| compare_at(a, b, "/output/messageId"));
        }
        Value::Array(items)
    }
}

/// Remove a dotted path; missing segments are ignored
fn remove_path(item: &mut Value, dotted: &str) {
    let mut segments: Vec<&str> = dotted.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };
    let mut current = item;
    for segment in segments {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(leaf);
    }
}

fn compare_at(a: &Value, b: &Value, pointer: &str) -> Ordering {
    sort_key(a.pointer(pointer)).cmp(&sort_key(b.pointer(pointer)))
}

fn sort_key(value: Option<&Value>) -> Option<String> {
    value.map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

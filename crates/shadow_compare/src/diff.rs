//! Structural comparison of normalized payloads

use assert_json_diff::{assert_json_matches_no_panic, CompareMode, Config};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonOutcome {
    pub matched: bool,
    /// Rendered differences, present on mismatch
    pub diff: Option<String>,
}

/// Strict equality; extra keys on either side count as differences
pub fn compare(legacy: &Value, primary: &Value) -> ComparisonOutcome {
    match assert_json_matches_no_panic(primary, legacy, Config::new(CompareMode::Strict)) {
        Ok(()) => ComparisonOutcome {
            matched: true,
            diff: None,
        },
        Err(diff) => ComparisonOutcome {
            matched: false,
            diff: Some(diff),
        },
    }
}

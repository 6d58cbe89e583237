//! Pipeline metrics
//!
//! Thin wrappers over the `metrics` facade so every crate emits the same
//! names and label keys. Without an installed recorder these are no-ops.

use std::time::Duration;

use contracts::TransformerStage;
use metrics::{counter, histogram};

// ===== Destination transform =====

/// Events entering a dispatch path (`feature` = processor | router | batch)
pub fn record_dest_transform_input(destination: &str, feature: &'static str, count: usize) {
    counter!(
        "dest_transform_input_events",
        "destination" => destination.to_string(),
        "feature" => feature
    )
    .increment(count as u64);
}

/// Result records leaving a dispatch path
pub fn record_dest_transform_output(destination: &str, feature: &'static str, count: usize) {
    counter!(
        "dest_transform_output_events",
        "destination" => destination.to_string(),
        "feature" => feature
    )
    .increment(count as u64);
}

/// One failed event or group
pub fn record_dest_transform_error(destination: &str, stage: TransformerStage, status: u16) {
    counter!(
        "dest_transform_errors",
        "destination" => destination.to_string(),
        "stage" => stage.as_str(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_dest_transform_latency(destination: &str, feature: &'static str, elapsed: Duration) {
    histogram!(
        "dest_transform_request_latency",
        "destination" => destination.to_string(),
        "feature" => feature
    )
    .record(elapsed.as_secs_f64());
}

/// Destination-instance groups built by router dispatch
pub fn record_router_groups(destination: &str, groups: usize) {
    counter!(
        "router_transform_groups",
        "destination" => destination.to_string()
    )
    .increment(groups as u64);
}

// ===== Proxy =====

/// Duration of the live call alone
pub fn record_proxy_time(destination: &str, elapsed: Duration) {
    histogram!(
        "transformer_proxy_time",
        "destination" => destination.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Duration of the whole proxy path, response handling included
pub fn record_total_proxy_latency(destination: &str, status: u16, elapsed: Duration) {
    histogram!(
        "transformer_total_proxy_latency",
        "destination" => destination.to_string(),
        "status" => status.to_string()
    )
    .record(elapsed.as_secs_f64());
}

// ===== User transform =====

pub fn record_user_transform_input(process_sessions: bool, count: usize) {
    counter!(
        "user_transform_input_events",
        "processSessions" => process_sessions.to_string()
    )
    .increment(count as u64);
}

pub fn record_user_transform_group_size(version_id: &str, size: usize) {
    histogram!(
        "user_transform_function_group_size",
        "transformationVersionId" => version_id.to_string()
    )
    .record(size as f64);
}

pub fn record_user_transform_latency(version_id: &str, elapsed: Duration) {
    histogram!(
        "user_transform_function_latency",
        "transformationVersionId" => version_id.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Events failed by the user transform path
pub fn record_user_transform_errors(version_id: &str, process_sessions: bool, count: usize) {
    counter!(
        "user_transform_errors",
        "transformationVersionId" => version_id.to_string(),
        "processSessions" => process_sessions.to_string()
    )
    .increment(count as u64);
}

pub fn record_user_transform_output(process_sessions: bool, count: usize) {
    counter!(
        "user_transform_output_events",
        "processSessions" => process_sessions.to_string()
    )
    .increment(count as u64);
}

/// Transformation code fetch from the backend
pub fn record_get_transformation_code(version_id: &str, success: bool, elapsed: Duration) {
    histogram!(
        "get_transformation_code",
        "versionId" => version_id.to_string(),
        "success" => success.to_string()
    )
    .record(elapsed.as_secs_f64());
}

// ===== Comparison =====

/// Handler output versus alternate executor output
pub fn record_cdk_match(destination: &str, matched: bool) {
    let name = if matched {
        "cdk_response_match_success"
    } else {
        "cdk_response_match_failure"
    };
    counter!(name, "destination" => destination.to_string()).increment(1);
}

/// Primary pipeline versus legacy implementation
pub fn record_payload_match(path: &str, method: &str, matched: bool) {
    let name = if matched {
        "payload_success_match"
    } else {
        "payload_fail_match"
    };
    counter!(
        name,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
}

// ===== Credential cache =====

pub fn record_credential_cache_hit(cache: &'static str) {
    counter!("credential_cache_hits", "cache" => cache).increment(1);
}

pub fn record_credential_cache_refresh(cache: &'static str) {
    counter!("credential_cache_refreshes", "cache" => cache).increment(1);
}

pub fn record_credential_cache_refresh_error(cache: &'static str) {
    counter!("credential_cache_refresh_errors", "cache" => cache).increment(1);
}

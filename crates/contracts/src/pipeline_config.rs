//! PipelineConfig - Config Loader output
//!
//! Deployment settings for every dispatch path: concurrency, handler
//! aliases, credential and transformation backends, shadow comparison and
//! logging/metrics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    #[serde(default)]
    pub version: ConfigVersion,

    #[serde(default)]
    #[validate(nested)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    #[validate(nested)]
    pub custom_transform: CustomTransformConfig,

    #[serde(default)]
    #[validate(nested)]
    pub shadow: ShadowConfig,

    #[serde(default)]
    pub observability: ObservabilitySettings,
}

/// Dispatch path tuning
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchConfig {
    /// Upper bound of in-flight handler calls per dispatch call
    #[serde(default = "default_max_concurrency")]
    #[validate(range(min = 1))]
    pub max_concurrency: usize,

    /// userId handling for payloads that carry an error status
    #[serde(default)]
    pub error_status_user_id: ErrorStatusUserId,

    /// Timeout of the built-in HTTP network handler
    #[serde(default = "default_proxy_timeout_ms")]
    #[validate(range(min = 1))]
    pub proxy_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            error_status_user_id: ErrorStatusUserId::default(),
            proxy_timeout_ms: default_proxy_timeout_ms(),
        }
    }
}

fn default_max_concurrency() -> usize {
    256
}

fn default_proxy_timeout_ms() -> u64 {
    30_000
}

/// userId policy for payloads whose own `statusCode` is 400
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatusUserId {
    /// Falsy becomes `""`, any other value is left untouched
    #[default]
    Preserve,
    /// Falsy becomes `""`, any other value is rendered as a string
    Stringify,
}

/// Handler registry settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// External name -> canonical handler name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Destinations whose output is compared against the alternate executor
    #[serde(default)]
    pub cdk_destinations: Vec<String>,
}

/// Account token backend
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CredentialsConfig {
    #[serde(default)]
    #[validate(url)]
    pub backend_url: Option<String>,

    /// Logical validity of a fetched token
    #[serde(default = "default_token_ttl_secs")]
    #[validate(range(min = 1))]
    pub token_ttl_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

fn default_token_ttl_secs() -> u64 {
    3000
}

/// User transformation settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CustomTransformConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Transformation code backend
    #[serde(default)]
    #[validate(url)]
    pub backend_url: Option<String>,

    #[serde(default = "default_code_ttl_secs")]
    #[validate(range(min = 1))]
    pub code_ttl_secs: u64,

    /// Upper bound of user transformation groups running at once
    #[serde(default = "default_max_concurrency")]
    #[validate(range(min = 1))]
    pub max_concurrency: usize,
}

impl Default for CustomTransformConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend_url: None,
            code_ttl_secs: default_code_ttl_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_code_ttl_secs() -> u64 {
    600
}

/// Shadow comparison settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ShadowConfig {
    /// Legacy implementation base URL; comparison is off when absent
    #[serde(default)]
    #[validate(url)]
    pub legacy_url: Option<String>,

    /// Route substrings that enable comparison
    #[serde(default = "default_include_routes")]
    pub include_routes: Vec<String>,

    /// Route substrings that disable comparison, checked first
    #[serde(default = "default_exclude_routes")]
    pub exclude_routes: Vec<String>,

    /// Extra strip rules, applied after the built-in ones
    #[serde(default)]
    pub rules: Vec<ShadowRule>,

    /// Timeout of the legacy call
    #[serde(default = "default_legacy_timeout_ms")]
    #[validate(range(min = 1))]
    pub legacy_timeout_ms: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            legacy_url: None,
            include_routes: default_include_routes(),
            exclude_routes: default_exclude_routes(),
            rules: Vec::new(),
            legacy_timeout_ms: default_legacy_timeout_ms(),
        }
    }
}

fn default_include_routes() -> Vec<String> {
    vec!["/v0/".to_string(), "/customTransform".to_string()]
}

fn default_exclude_routes() -> Vec<String> {
    vec!["/v0/sources/webhook".to_string()]
}

fn default_legacy_timeout_ms() -> u64 {
    10_000
}

/// Fields stripped from every result item on matching routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowRule {
    /// Route substring the rule applies to
    pub route: String,

    /// Dotted paths relative to one result item (`output.headers.Authorization`)
    pub strip: Vec<String>,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    #[serde(default)]
    pub log_format: LogFormatSetting,

    /// Level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub default_log_level: String,

    /// Prometheus exporter port; no exporter when absent
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_format: LogFormatSetting::default(),
            default_log_level: default_log_level(),
            metrics_port: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormatSetting {
    Json,
    #[default]
    Pretty,
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_concurrency, 256);
        assert_eq!(config.shadow.include_routes, vec!["/v0/", "/customTransform"]);
        assert!(config.custom_transform.enabled);
    }

    #[test]
    fn derive_rules_reject_zero_and_bad_url() {
        let mut config = PipelineConfig::default();
        config.dispatch.max_concurrency = 0;
        config.shadow.legacy_url = Some("not a url".into());

        let errors = config.validate().unwrap_err();
        assert!(errors.errors().contains_key("dispatch"));
        assert!(errors.errors().contains_key("shadow"));
        assert!(!errors.errors().contains_key("credentials"));
    }

    #[test]
    fn policy_names_are_snake_case() {
        let parsed: DispatchConfig =
            serde_json::from_str(r#"{"error_status_user_id": "stringify"}"#).unwrap();
        assert_eq!(parsed.error_status_user_id, ErrorStatusUserId::Stringify);
        assert_eq!(parsed.proxy_timeout_ms, 30_000);
    }
}

//! Configuration validation
//!
//! Field-level rules come from the `validator` derives on the config types;
//! cross-field rules live here:
//! - alias keys and targets non-empty
//! - no alias chains
//! - cdk destination names non-empty
//! - shadow rules carry a route and at least one path

use contracts::{PipelineConfig, PipelineError};
use validator::Validate;

/// Validate a parsed configuration
///
/// Returns the first error encountered.
pub fn validate(config: &PipelineConfig) -> Result<(), PipelineError> {
    validate_fields(config)?;
    validate_aliases(config)?;
    validate_cdk_destinations(config)?;
    validate_shadow_rules(config)?;
    Ok(())
}

fn validate_fields(config: &PipelineConfig) -> Result<(), PipelineError> {
    config.validate().map_err(|errors| {
        let field = errors
            .errors()
            .keys()
            .next()
            .map(|k| k.to_string())
            .unwrap_or_default();
        PipelineError::config_validation(field, errors.to_string())
    })
}

fn validate_aliases(config: &PipelineConfig) -> Result<(), PipelineError> {
    let aliases = &config.registry.aliases;
    for (alias, target) in aliases {
        if alias.trim().is_empty() || target.trim().is_empty() {
            return Err(PipelineError::config_validation(
                format!("registry.aliases[{alias}]"),
                "alias name and target cannot be empty",
            ));
        }
        let chained = aliases
            .keys()
            .any(|other| other.trim().eq_ignore_ascii_case(target.trim()));
        if chained {
            return Err(PipelineError::config_validation(
                format!("registry.aliases[{alias}]"),
                format!("alias target '{target}' is itself an alias"),
            ));
        }
    }
    Ok(())
}

fn validate_cdk_destinations(config: &PipelineConfig) -> Result<(), PipelineError> {
    for (idx, name) in config.registry.cdk_destinations.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(PipelineError::config_validation(
                format!("registry.cdk_destinations[{idx}]"),
                "destination name cannot be empty",
            ));
        }
    }
    Ok(())
}

fn validate_shadow_rules(config: &PipelineConfig) -> Result<(), PipelineError> {
    for (idx, rule) in config.shadow.rules.iter().enumerate() {
        if rule.route.is_empty() {
            return Err(PipelineError::config_validation(
                format!("shadow.rules[{idx}].route"),
                "rule route cannot be empty",
            ));
        }
        if rule.strip.is_empty() || rule.strip.iter().any(|p| p.is_empty()) {
            return Err(PipelineError::config_validation(
                format!("shadow.rules[{idx}].strip"),
                "rule needs at least one non-empty path",
            ));
        }
    }
    Ok(())
}

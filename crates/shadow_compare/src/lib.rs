//! # Shadow Compare
//!
//! Mirrors dispatch requests to a legacy implementation and diffs the
//! normalized outputs. Purely observational: the primary result is always
//! returned unchanged.

pub mod diff;
pub mod legacy;
pub mod middleware;
pub mod normalize;

pub use diff::{compare, ComparisonOutcome};
pub use legacy::{HttpLegacyTarget, LegacyError, LegacyTarget, LocalLegacyTarget, MirroredRequest};
pub use middleware::{compare_payloads, ComparisonStats, ComparisonStatsSnapshot, ShadowComparison};
pub use normalize::{builtin_rules, Normalizer};

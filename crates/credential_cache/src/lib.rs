//! # Credential Cache
//!
//! Process-lifetime store for short-lived credentials.
//!
//! - `CredentialCache`: generic key -> value cache, TTL per instance,
//!   single-flight refresh per key
//! - `AccountTokenCache`: destination account tokens from the config backend

pub mod account;
pub mod cache;

pub use account::{AccountTokenCache, TokenFetchError};
pub use cache::{CacheError, CacheStats, CacheStatsSnapshot, CredentialCache};

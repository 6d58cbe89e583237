//! # Custom Transform
//!
//! Runs versioned user transformations over event batches.
//!
//! - `CustomTransformExecutor`: groups by destination + source (+ session),
//!   one runtime call per group, per-item result reshaping
//! - `UserTransformRuntime`: the external code runtime
//! - `TransformationStore`: transformation code from the config backend,
//!   cached per version ID

pub mod executor;
pub mod runtime;
pub mod store;

pub use executor::{
    group_key, CustomTransformExecutor, ExecutorStats, ExecutorStatsSnapshot, VERSION_NOT_FOUND,
};
pub use runtime::{
    LocalUserTransformRuntime, RuntimeExecutionError, UserTransformOutput, UserTransformRuntime,
};
pub use store::{
    CodeEngine, LocalCodeEngine, StoreBackedRuntime, StoreError, TransformationCode,
    TransformationStore,
};

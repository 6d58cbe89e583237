//! # Contracts
//!
//! Frozen interface contracts shared by every pipeline crate: the event and
//! result data model, the error taxonomy, the destination capability traits
//! and the pipeline configuration types.
//! Business crates depend on this crate only, never on each other's internals.
//!
//! ## Wire model
//! - Field names follow the upstream JSON shape (`statusCode`, `statTags`,
//!   `destination.ID`, `destination.Config`) via serde renames.
//! - Events are immutable as received; dispatch paths clone a working copy
//!   before handing it to a handler.

mod destination_name;
mod error;
mod event;
mod grouping;
mod handler;
mod pipeline_config;
mod proxy;
mod result;

pub use destination_name::DestinationName;
pub use error::*;
pub use event::*;
pub use grouping::{chunk, GroupedBatch};
pub use handler::*;
pub use pipeline_config::*;
pub use proxy::*;
pub use result::*;

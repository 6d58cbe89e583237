//! # Handler Registry
//!
//! Destination handler registry.
//!
//! Responsibilities:
//! - Hold one `DestinationHandler` record per destination, built at startup
//! - Resolve external destination names through a canonical alias map
//! - Report capability presence without calling the handler
//! - Fail with `NotFound` / `UnsupportedOperation` for routing misses
//! - Provide a `MockHandler` implementing every capability for tests

pub mod handler;
pub mod mock_handler;
pub mod registry;

pub use handler::{DestinationHandler, DestinationHandlerBuilder};
pub use mock_handler::{MockBehavior, MockHandler};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};

//! # Dispatcher
//!
//! Dispatch paths of the event pipeline.
//!
//! - Processor: one handler call per event, failures isolated per event
//! - Router: events grouped by destination instance, one call per group
//! - Batch: pure request merging per destination instance
//! - Proxy: live call through a network handler, always one envelope
//! - Bulk: file upload, polling, job status and user deletion

pub mod batch;
pub mod bulk;
pub mod dispatcher;
pub mod error;
pub mod http_network;
pub mod metrics;
pub mod processor;
pub mod proxy;
pub mod resolver;
pub mod router;

pub use batch::BatchDispatch;
pub use bulk::BulkDispatch;
pub use dispatcher::{create_dispatcher, Dispatcher, DispatcherBuilder};
pub use error::DispatcherError;
pub use http_network::HttpNetworkHandler;
pub use metrics::{DispatchMetrics, DispatchMetricsSnapshot};
pub use processor::{normalize_user_id, ProcessorDispatch};
pub use proxy::ProxyDispatch;
pub use resolver::{PassthroughResolver, TemplateResolver};
pub use router::RouterDispatch;

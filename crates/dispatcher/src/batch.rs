//! Batch dispatch
//!
//! Pure request merging per destination instance. Unlike router dispatch a
//! failing group fails the whole call.

use std::sync::Arc;

use contracts::{
    BatchedRequest, Batcher, DynamicConfigResolver, Event, GroupedBatch, PipelineError,
    ResolveMode, TransformError,
};
use handler_registry::HandlerRegistry;
use observability::metrics as pipeline_metrics;
use tracing::{error, instrument};

use crate::metrics::DispatchMetrics;

const FEATURE: &str = "batch";

#[derive(Clone)]
pub struct BatchDispatch {
    registry: Arc<HandlerRegistry>,
    resolver: Arc<dyn DynamicConfigResolver>,
    metrics: Arc<DispatchMetrics>,
}

impl BatchDispatch {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        resolver: Arc<dyn DynamicConfigResolver>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            registry,
            resolver,
            metrics,
        }
    }

    /// Merge the batch into destination requests
    ///
    /// # Errors
    /// `Validation` for an empty batch, routing errors for a destination
    /// without `batch`, `BatchFailed` listing every failed group.
    #[instrument(
        name = "batch_dispatch",
        skip(self, events),
        fields(destination = %destination, events = events.len())
    )]
    pub fn dispatch(
        &self,
        destination: &str,
        events: Vec<Event>,
    ) -> Result<Vec<BatchedRequest>, PipelineError> {
        if events.is_empty() {
            return Err(PipelineError::empty_batch());
        }
        let batcher = self.registry.batcher(destination)?;
        pipeline_metrics::record_dest_transform_input(destination, FEATURE, events.len());
        self.metrics.add_events_in(events.len());

        let groups = GroupedBatch::build(events, |e| e.destination.id.clone());
        self.metrics.add_groups(groups.len());

        let mut requests = Vec::new();
        let mut errors = Vec::new();
        for (destination_id, group) in groups {
            match self.merge_group(batcher.as_ref(), group) {
                Ok(mut merged) => requests.append(&mut merged),
                Err(e) => {
                    error!(destination = %destination, destination_id = %destination_id, error = %e, "batch group failed");
                    self.metrics.inc_results_failed();
                    errors.push(if e.message.is_empty() {
                        "Error occurred while processing payload.".to_string()
                    } else {
                        e.message
                    });
                }
            }
        }

        if !errors.is_empty() {
            return Err(PipelineError::BatchFailed { errors });
        }
        self.metrics.add_results_ok(requests.len());
        pipeline_metrics::record_dest_transform_output(destination, FEATURE, requests.len());
        Ok(requests)
    }

    fn merge_group(
        &self,
        batcher: &dyn Batcher,
        mut group: Vec<Event>,
    ) -> Result<Vec<BatchedRequest>, TransformError> {
        for event in &mut group {
            self.resolver.resolve(event, ResolveMode::Batch)?;
        }
        batcher.batch(group)
    }
}

//! Router dispatch
//!
//! Partitions a batch by destination instance and hands each group to the
//! handler's batch-aware transform. Groups run concurrently; a failing group
//! yields one error record carrying the metadata of all its events. Output
//! keeps group order (first occurrence of each destination ID).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use contracts::{
    Destination, DynamicConfigResolver, ErrorEnvelope, Event, EventMetadata, GroupedBatch,
    PipelineError, ResolveMode, RouterTransformer, TransformError, TransformResult,
    TransformerStage,
};
use handler_registry::HandlerRegistry;
use observability::metrics as pipeline_metrics;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

use crate::metrics::DispatchMetrics;

const FEATURE: &str = "router";

/// Batch-aware transform path for router delivery
#[derive(Clone)]
pub struct RouterDispatch {
    registry: Arc<HandlerRegistry>,
    resolver: Arc<dyn DynamicConfigResolver>,
    limiter: Arc<Semaphore>,
    metrics: Arc<DispatchMetrics>,
}

/// Identity of a group, kept outside its task for failure reporting
struct GroupInfo {
    index: usize,
    metadata: Vec<EventMetadata>,
    destination: Destination,
}

impl RouterDispatch {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        resolver: Arc<dyn DynamicConfigResolver>,
        limiter: Arc<Semaphore>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            registry,
            resolver,
            limiter,
            metrics,
        }
    }

    /// Transform every destination-instance group of the batch
    ///
    /// # Errors
    /// `Validation` for an empty batch; `NotFound`/`UnsupportedOperation`
    /// when the destination has no router transform.
    #[instrument(
        name = "router_dispatch",
        skip(self, events),
        fields(destination = %destination, events = events.len())
    )]
    pub async fn dispatch(
        &self,
        destination: &str,
        events: Vec<Event>,
    ) -> Result<Vec<TransformResult>, PipelineError> {
        if events.is_empty() {
            return Err(PipelineError::empty_batch());
        }
        let router = self.registry.router(destination)?;

        let started = Instant::now();
        pipeline_metrics::record_dest_transform_input(destination, FEATURE, events.len());
        self.metrics.add_events_in(events.len());

        let groups = GroupedBatch::build(events, |e| e.destination.id.clone());
        pipeline_metrics::record_router_groups(destination, groups.len());
        self.metrics.add_groups(groups.len());
        debug!(groups = groups.len(), "router groups built");

        let mut slots: Vec<Option<Vec<TransformResult>>> = vec![None; groups.len()];
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, GroupInfo> = HashMap::new();

        for (index, (_, group)) in groups.into_iter().enumerate() {
            let info = GroupInfo {
                index,
                metadata: group.iter().map(|e| e.metadata.clone()).collect(),
                destination: group
                    .first()
                    .map(|e| e.destination.clone())
                    .unwrap_or_default(),
            };
            let router = Arc::clone(&router);
            let resolver = Arc::clone(&self.resolver);
            let limiter = Arc::clone(&self.limiter);
            let handle = tasks.spawn(async move {
                let _permit = limiter.acquire().await;
                transform_group(router.as_ref(), resolver.as_ref(), group).await
            });
            in_flight.insert(handle.id(), info);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (info, outcome) = match joined {
                Ok((id, outcome)) => match in_flight.remove(&id) {
                    Some(info) => (info, outcome),
                    None => continue,
                },
                Err(join_error) => {
                    let Some(info) = in_flight.remove(&join_error.id()) else {
                        continue;
                    };
                    error!(destination = %destination, error = %join_error, "router task aborted");
                    let failure = TransformError::upstream(format!(
                        "router transform for {destination} aborted"
                    ));
                    (info, Err(failure))
                }
            };

            let records = match outcome {
                Ok(records) => {
                    self.metrics.add_results_ok(records.len());
                    records
                }
                Err(e) => {
                    error!(
                        destination = %destination,
                        destination_id = %info.destination.id,
                        events = info.metadata.len(),
                        error = %e,
                        "router group failed"
                    );
                    vec![self.group_failure(destination, &e, info.metadata, info.destination)]
                }
            };
            slots[info.index] = Some(records);
        }

        let results: Vec<TransformResult> = slots.into_iter().flatten().flatten().collect();
        pipeline_metrics::record_dest_transform_output(destination, FEATURE, results.len());
        pipeline_metrics::record_dest_transform_latency(destination, FEATURE, started.elapsed());
        Ok(results)
    }

    fn group_failure(
        &self,
        destination: &str,
        error: &TransformError,
        metadata: Vec<EventMetadata>,
        target: Destination,
    ) -> TransformResult {
        pipeline_metrics::record_dest_transform_error(
            destination,
            TransformerStage::Transform,
            error.status,
        );
        self.metrics.inc_results_failed();

        let envelope = ErrorEnvelope::from_error(error, destination, TransformerStage::Transform);
        let mut result = TransformResult::from_envelope(envelope, metadata);
        result.batched = Some(false);
        result.destination = Some(target);
        result
    }
}

async fn transform_group(
    router: &dyn RouterTransformer,
    resolver: &dyn DynamicConfigResolver,
    mut group: Vec<Event>,
) -> Result<Vec<TransformResult>, TransformError> {
    for event in &mut group {
        resolver.resolve(event, ResolveMode::Router)?;
    }
    router.process_router_dest(group).await
}

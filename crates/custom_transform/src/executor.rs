//! Custom transformation executor
//!
//! Groups a batch by destination and source (and session when requested),
//! runs the destination's user transformation once per group and reshapes
//! the returned items into result records. Groups run concurrently and are
//! reported in order of first occurrence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use contracts::{
    CommonMetadata, CustomTransformConfig, ErrorEnvelope, Event, EventMetadata, GroupedBatch,
    PipelineError, ResultMetadata, TransformError, TransformResult, TransformerStage,
};
use observability::metrics as pipeline_metrics;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

use crate::runtime::{UserTransformOutput, UserTransformRuntime};

pub const VERSION_NOT_FOUND: &str = "Transformation VersionID not found";

/// Executor counters
#[derive(Debug, Default)]
pub struct ExecutorStats {
    groups: AtomicU64,
    runtime_calls: AtomicU64,
    failed_events: AtomicU64,
}

impl ExecutorStats {
    pub fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            groups: self.groups.load(Ordering::Relaxed),
            runtime_calls: self.runtime_calls.load(Ordering::Relaxed),
            failed_events: self.failed_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    pub groups: u64,
    pub runtime_calls: u64,
    pub failed_events: u64,
}

pub struct CustomTransformExecutor<R> {
    runtime: Arc<R>,
    limiter: Arc<Semaphore>,
    stats: Arc<ExecutorStats>,
}

impl<R> Clone for CustomTransformExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            limiter: Arc::clone(&self.limiter),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<R> CustomTransformExecutor<R>
where
    R: UserTransformRuntime + Sync + 'static,
{
    /// `limiter` bounds the groups running at once; it may be shared with
    /// other dispatch paths
    pub fn new(runtime: R, limiter: Arc<Semaphore>) -> Self {
        Self {
            runtime: Arc::new(runtime),
            limiter,
            stats: Arc::new(ExecutorStats::default()),
        }
    }

    /// `None` when user transformations are disabled
    pub fn from_config(config: &CustomTransformConfig, runtime: R) -> Option<Self> {
        config.enabled.then(|| {
            Self::new(runtime, Arc::new(Semaphore::new(config.max_concurrency)))
        })
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run user transformations for the batch
    ///
    /// # Errors
    /// `Validation` for an empty batch. Every other failure is reported
    /// per event or per group as a 400 result record.
    #[instrument(name = "custom_transform_execute", skip(self, events), fields(events = events.len()))]
    pub async fn execute(
        &self,
        events: Vec<Event>,
        process_sessions: bool,
    ) -> Result<Vec<TransformResult>, PipelineError> {
        if events.is_empty() {
            return Err(PipelineError::empty_batch());
        }
        pipeline_metrics::record_user_transform_input(process_sessions, events.len());

        // library versions come from the first event of the batch
        let libraries: Arc<Vec<String>> = Arc::new(
            events[0]
                .libraries
                .iter()
                .map(|l| l.version_id.clone())
                .collect(),
        );

        let groups = GroupedBatch::build(events, |e| group_key(e, process_sessions));
        self.stats
            .groups
            .fetch_add(groups.len() as u64, Ordering::Relaxed);
        debug!(groups = groups.len(), process_sessions, "user transform groups built");

        let mut slots: Vec<Option<Vec<TransformResult>>> = vec![None; groups.len()];
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, (usize, Vec<EventMetadata>)> = HashMap::new();

        for (index, (key, group)) in groups.into_iter().enumerate() {
            let metadata: Vec<EventMetadata> = group.iter().map(|e| e.metadata.clone()).collect();
            let task = GroupTask {
                runtime: Arc::clone(&self.runtime),
                limiter: Arc::clone(&self.limiter),
                stats: Arc::clone(&self.stats),
                libraries: Arc::clone(&libraries),
                process_sessions,
            };
            let handle = tasks.spawn(async move { task.run(key, group).await });
            in_flight.insert(handle.id(), (index, metadata));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, records)) => {
                    if let Some((index, _)) = in_flight.remove(&id) {
                        slots[index] = Some(records);
                    }
                }
                Err(join_error) => {
                    let Some((index, metadata)) = in_flight.remove(&join_error.id()) else {
                        continue;
                    };
                    error!(error = %join_error, "user transform group aborted");
                    let message = "user transformation aborted".to_string();
                    self.stats
                        .failed_events
                        .fetch_add(metadata.len() as u64, Ordering::Relaxed);
                    slots[index] = Some(
                        metadata
                            .into_iter()
                            .map(|m| failure(&message, m.into()))
                            .collect(),
                    );
                }
            }
        }

        let results: Vec<TransformResult> = slots.into_iter().flatten().flatten().collect();
        pipeline_metrics::record_user_transform_output(process_sessions, results.len());
        Ok(results)
    }
}

/// Grouping key of an event
///
/// With sessions: `{destination.ID}_{sourceId}_{rudderId or anonymousId}`,
/// otherwise `{metadata.destinationId}_{sourceId}`.
pub fn group_key(event: &Event, process_sessions: bool) -> String {
    if process_sessions {
        let session = event
            .metadata
            .rudder_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| event.anonymous_id())
            .unwrap_or_default();
        format!(
            "{}_{}_{}",
            event.destination.id, event.metadata.source_id, session
        )
    } else {
        format!(
            "{}_{}",
            event.metadata.destination_id, event.metadata.source_id
        )
    }
}

struct GroupTask<R> {
    runtime: Arc<R>,
    limiter: Arc<Semaphore>,
    stats: Arc<ExecutorStats>,
    libraries: Arc<Vec<String>>,
    process_sessions: bool,
}

impl<R> GroupTask<R>
where
    R: UserTransformRuntime + Sync + 'static,
{
    async fn run(self, key: String, group: Vec<Event>) -> Vec<TransformResult> {
        let metadata: Vec<EventMetadata> = group.iter().map(|e| e.metadata.clone()).collect();
        let common = CommonMetadata::from_group(metadata.iter());

        let Some(version_id) = group
            .first()
            .and_then(|e| e.destination.transformation_version_id())
            .map(str::to_string)
        else {
            error!(group = %key, "transformation version id not found");
            return self.fail_all(metadata, VERSION_NOT_FOUND, "");
        };

        let _permit = self.limiter.acquire().await;
        pipeline_metrics::record_user_transform_group_size(&version_id, group.len());
        self.stats.runtime_calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = self.runtime.run(group, &version_id, &self.libraries).await;
        pipeline_metrics::record_user_transform_latency(&version_id, started.elapsed());

        match outcome {
            Ok(items) => items
                .into_iter()
                .map(|item| self.reshape(item, &version_id, &common))
                .collect(),
            Err(e) => {
                error!(group = %key, version_id = %version_id, error = %e, "user transformation failed");
                self.fail_all(metadata, &e.message, &version_id)
            }
        }
    }

    fn reshape(
        &self,
        item: UserTransformOutput,
        version_id: &str,
        common: &CommonMetadata,
    ) -> TransformResult {
        let metadata = match item.metadata {
            Some(m) if m != EventMetadata::default() => ResultMetadata::Single(m),
            _ => ResultMetadata::Common(common.clone()),
        };

        if let Some(message) = item.error {
            error!(version_id = %version_id, error = %message, "user transformation returned an error");
            return self.record_failure(&message, metadata, version_id, 1);
        }
        match item.transformed_event {
            Some(event @ Value::Object(_)) => TransformResult::success(event, metadata),
            other => {
                let returned = other
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "undefined".to_string());
                let message = format!(
                    "returned event in events from user transformation is not an object. transformationVersionId:{version_id} and returned event: {returned}"
                );
                self.record_failure(&message, metadata, version_id, 1)
            }
        }
    }

    fn fail_all(
        &self,
        metadata: Vec<EventMetadata>,
        message: &str,
        version_id: &str,
    ) -> Vec<TransformResult> {
        pipeline_metrics::record_user_transform_errors(
            version_id,
            self.process_sessions,
            metadata.len(),
        );
        self.stats
            .failed_events
            .fetch_add(metadata.len() as u64, Ordering::Relaxed);
        metadata
            .into_iter()
            .map(|m| failure(message, m.into()))
            .collect()
    }

    fn record_failure(
        &self,
        message: &str,
        metadata: ResultMetadata,
        version_id: &str,
        count: usize,
    ) -> TransformResult {
        pipeline_metrics::record_user_transform_errors(version_id, self.process_sessions, count);
        self.stats
            .failed_events
            .fetch_add(count as u64, Ordering::Relaxed);
        failure(message, metadata)
    }
}

fn failure(message: &str, metadata: ResultMetadata) -> TransformResult {
    let destination_type = match &metadata {
        ResultMetadata::Single(m) => m.destination_type.clone(),
        ResultMetadata::Common(c) => c.destination_type.clone(),
        ResultMetadata::Batch(list) => list
            .first()
            .map(|m| m.destination_type.clone())
            .unwrap_or_default(),
    };
    let envelope = ErrorEnvelope::from_error(
        &TransformError::bad_request(message),
        &destination_type,
        TransformerStage::UserTransform,
    );
    TransformResult::from_envelope(envelope, metadata)
}

//! Processor dispatch
//!
//! Fans a batch out to one handler call per event. Every event runs in its
//! own task so a failing or panicking handler only fails that event.
//! Results are returned in completion order; callers that need input order
//! key by `metadata.messageId`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use assert_json_diff::{assert_json_matches_no_panic, CompareMode, Config};
use contracts::{
    scalar_to_string, strip_nulls, AlternateExecutor, DynamicConfigResolver, ErrorEnvelope,
    ErrorStatusUserId, Event, EventMetadata, PipelineError, Processor, RequestContext,
    ResolveMode, TransformError, TransformResult, TransformerStage,
};
use handler_registry::HandlerRegistry;
use observability::metrics as pipeline_metrics;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

use crate::metrics::DispatchMetrics;

const FEATURE: &str = "processor";

/// Single-event transform path
#[derive(Clone)]
pub struct ProcessorDispatch {
    registry: Arc<HandlerRegistry>,
    resolver: Arc<dyn DynamicConfigResolver>,
    alternate: Option<Arc<dyn AlternateExecutor>>,
    limiter: Arc<Semaphore>,
    user_id_policy: ErrorStatusUserId,
    metrics: Arc<DispatchMetrics>,
}

impl ProcessorDispatch {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        resolver: Arc<dyn DynamicConfigResolver>,
        limiter: Arc<Semaphore>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            registry,
            resolver,
            alternate: None,
            limiter,
            user_id_policy: ErrorStatusUserId::default(),
            metrics,
        }
    }

    /// Executor compared against config-driven destinations
    pub fn with_alternate(mut self, alternate: Arc<dyn AlternateExecutor>) -> Self {
        self.alternate = Some(alternate);
        self
    }

    pub fn with_user_id_policy(mut self, policy: ErrorStatusUserId) -> Self {
        self.user_id_policy = policy;
        self
    }

    /// Transform every event of the batch
    ///
    /// # Errors
    /// `Validation` for an empty batch; `NotFound`/`UnsupportedOperation`
    /// when the destination has no single-event transform. Per-event
    /// failures come back as error records, never as `Err`.
    #[instrument(
        name = "processor_dispatch",
        skip(self, events, request),
        fields(destination = %destination, events = events.len())
    )]
    pub async fn dispatch(
        &self,
        destination: &str,
        events: Vec<Event>,
        request: RequestContext,
    ) -> Result<Vec<TransformResult>, PipelineError> {
        if events.is_empty() {
            return Err(PipelineError::empty_batch());
        }
        let processor = self.registry.processor(destination)?;
        let alternate = self
            .alternate
            .clone()
            .filter(|_| self.registry.is_config_driven(destination));

        let started = Instant::now();
        pipeline_metrics::record_dest_transform_input(destination, FEATURE, events.len());
        self.metrics.add_events_in(events.len());

        let task = EventTask {
            destination: destination.to_string(),
            processor,
            resolver: Arc::clone(&self.resolver),
            alternate,
            limiter: Arc::clone(&self.limiter),
            user_id_policy: self.user_id_policy,
            metrics: Arc::clone(&self.metrics),
        };

        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, EventMetadata> = HashMap::new();
        for mut event in events {
            event.request = Some(request.clone());
            let metadata = event.metadata.clone();
            let task = task.clone();
            let handle = tasks.spawn(async move { task.run(event).await });
            in_flight.insert(handle.id(), metadata);
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, mut records)) => {
                    in_flight.remove(&id);
                    results.append(&mut records);
                }
                Err(join_error) => {
                    let metadata = in_flight.remove(&join_error.id()).unwrap_or_default();
                    error!(
                        destination = %destination,
                        message_id = %metadata.message_id,
                        error = %join_error,
                        "processor task aborted"
                    );
                    let failure = TransformError::upstream(format!(
                        "handler for {destination} aborted while processing the event"
                    ));
                    results.push(task.failure(&failure, metadata));
                }
            }
        }

        pipeline_metrics::record_dest_transform_output(destination, FEATURE, results.len());
        pipeline_metrics::record_dest_transform_latency(destination, FEATURE, started.elapsed());
        debug!(results = results.len(), "processor dispatch complete");
        Ok(results)
    }
}

/// Everything one per-event task needs, cloned into the task
#[derive(Clone)]
struct EventTask {
    destination: String,
    processor: Arc<dyn Processor>,
    resolver: Arc<dyn DynamicConfigResolver>,
    alternate: Option<Arc<dyn AlternateExecutor>>,
    limiter: Arc<Semaphore>,
    user_id_policy: ErrorStatusUserId,
    metrics: Arc<DispatchMetrics>,
}

impl EventTask {
    async fn run(self, event: Event) -> Vec<TransformResult> {
        let _permit = self.limiter.acquire().await;
        let metadata = event.metadata.clone();

        match self.transform(event).await {
            Ok(payloads) => {
                self.metrics.add_results_ok(payloads.len());
                payloads
                    .into_iter()
                    .map(|payload| {
                        TransformResult::success(
                            normalize_user_id(payload, self.user_id_policy),
                            metadata.clone(),
                        )
                    })
                    .collect()
            }
            Err(e) => {
                error!(
                    destination = %self.destination,
                    message_id = %metadata.message_id,
                    status = e.status,
                    error = %e,
                    "event transform failed"
                );
                vec![self.failure(&e, metadata)]
            }
        }
    }

    async fn transform(&self, mut working: Event) -> Result<Vec<Value>, TransformError> {
        self.resolver.resolve(&mut working, ResolveMode::Processor)?;
        // handlers may mutate their input; the comparison runs on this copy
        let as_resolved = self.alternate.as_ref().map(|_| working.clone());

        let payloads = self.processor.process(working).await?;

        if let (Some(alternate), Some(event)) = (&self.alternate, as_resolved) {
            let matched =
                compare_alternate(alternate.as_ref(), &self.destination, event, &payloads).await;
            pipeline_metrics::record_cdk_match(&self.destination, matched);
            self.metrics.inc_cdk(matched);
        }
        Ok(payloads)
    }

    fn failure(&self, error: &TransformError, metadata: EventMetadata) -> TransformResult {
        pipeline_metrics::record_dest_transform_error(
            &self.destination,
            TransformerStage::Transform,
            error.status,
        );
        self.metrics.inc_results_failed();
        let envelope =
            ErrorEnvelope::from_error(error, &self.destination, TransformerStage::Transform);
        TransformResult::from_envelope(envelope, metadata)
    }
}

/// Run the alternate executor and compare with the handler's payloads
///
/// An executor failure counts as a mismatch; the handler's output is kept
/// either way.
async fn compare_alternate(
    alternate: &dyn AlternateExecutor,
    destination: &str,
    event: Event,
    primary: &[Value],
) -> bool {
    let message_id = event.metadata.message_id.clone();
    let snapshot = serde_json::to_string(&event).unwrap_or_default();

    let alternate_output = match alternate.execute(destination, event).await {
        Ok(output) => output,
        Err(e) => {
            warn!(
                destination = %destination,
                message_id = %message_id,
                error = %e,
                "alternate executor failed"
            );
            return false;
        }
    };

    let expected = strip_nulls(Value::Array(primary.to_vec()));
    let actual = strip_nulls(Value::Array(alternate_output));
    match assert_json_matches_no_panic(&actual, &expected, Config::new(CompareMode::Strict)) {
        Ok(()) => true,
        Err(diff) => {
            warn!(
                destination = %destination,
                message_id = %message_id,
                event = %snapshot,
                diff = %diff,
                "payload mismatch against alternate executor"
            );
            false
        }
    }
}

/// Coerce `userId` so downstream consumers only ever see a string
///
/// Falsy values become `""`. Payloads carrying `statusCode: 400` keep a
/// truthy non-string value under [`ErrorStatusUserId::Preserve`].
pub fn normalize_user_id(mut payload: Value, policy: ErrorStatusUserId) -> Value {
    let Value::Object(map) = &mut payload else {
        return payload;
    };
    let error_status = map.get("statusCode").and_then(Value::as_u64) == Some(400);
    let user_id = map.remove("userId").unwrap_or(Value::Null);

    let normalized = if is_falsy(&user_id) {
        Value::String(String::new())
    } else if error_status && policy == ErrorStatusUserId::Preserve {
        user_id
    } else {
        Value::String(scalar_to_string(&user_id))
    };
    map.insert("userId".to_string(), normalized);
    payload
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use contracts::{Capability, Destination};
    use handler_registry::{DestinationHandler, MockBehavior, MockHandler};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::resolver::{PassthroughResolver, TemplateResolver};

    fn event(id: &str, message: Value) -> Event {
        Event {
            message,
            destination: Destination {
                id: "dest-1".into(),
                config: serde_json::from_value(json!({"key": "{{ message.key || \"none\" }}"}))
                    .unwrap(),
                ..Default::default()
            },
            metadata: EventMetadata {
                source_id: "src-1".into(),
                destination_id: "dest-1".into(),
                destination_type: "GA".into(),
                message_id: id.into(),
                ..Default::default()
            },
            libraries: Vec::new(),
            request: None,
        }
    }

    fn dispatch_with(mock: Arc<MockHandler>, registry_cdk: bool) -> ProcessorDispatch {
        let mut builder = HandlerRegistry::builder()
            .register(DestinationHandler::builder("ga").processor(mock).build());
        if registry_cdk {
            builder = builder.config_driven("ga");
        }
        ProcessorDispatch::new(
            Arc::new(builder.build()),
            Arc::new(TemplateResolver),
            Arc::new(Semaphore::new(4)),
            Arc::new(DispatchMetrics::new()),
        )
    }

    struct FixedExecutor {
        output: Vec<Value>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl AlternateExecutor for FixedExecutor {
        async fn execute(
            &self,
            _destination: &str,
            _event: Event,
        ) -> Result<Vec<Value>, TransformError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.output.clone())
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_nothing_is_dropped() {
        let mock = Arc::new(MockHandler::with_behavior(MockBehavior {
            fail_message_ids: vec!["m2".into()],
            panic_message_ids: vec!["m3".into()],
            ..Default::default()
        }));
        let dispatch = dispatch_with(mock.clone(), false);

        let events = vec![
            event("m1", json!({"userId": "u1", "fanout": 2})),
            event("m2", json!({"userId": "u2"})),
            event("m3", json!({"userId": "u3"})),
            event("m4", json!({"userId": "u4"})),
        ];
        let results = dispatch
            .dispatch("ga", events, RequestContext::default())
            .await
            .unwrap();

        // two payloads for m1, one for m4, one failure each for m2 and m3
        assert_eq!(results.len(), 5);
        assert_eq!(mock.process_calls(), 4);

        let failed: BTreeMap<_, _> = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| (r.message_ids()[0].to_string(), r.clone()))
            .collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed["m2"].status_code, 400);
        assert_eq!(failed["m2"].error.as_deref(), Some("invalid event m2"));
        let tags = failed["m2"].stat_tags.as_ref().unwrap();
        assert_eq!(tags["stage"], "transform");
        assert_eq!(tags["destType"], "GA");
        assert_eq!(failed["m3"].status_code, 500);

        let snapshot = dispatch.metrics.snapshot();
        assert_eq!(snapshot.events_in, 4);
        assert_eq!(snapshot.results_ok, 3);
        assert_eq!(snapshot.results_failed, 2);
    }

    #[tokio::test]
    async fn test_query_and_dynamic_config_reach_the_handler() {
        let dispatch = dispatch_with(Arc::new(MockHandler::new()), false);
        let request = RequestContext {
            query: BTreeMap::from([("processSessions".to_string(), "true".to_string())]),
        };

        let results = dispatch
            .dispatch("GA", vec![event("m1", json!({"key": "k-1"}))], request)
            .await
            .unwrap();

        let output = results[0].output.as_ref().unwrap();
        assert_eq!(output["config"]["key"], json!("k-1"));
        assert_eq!(output["query"]["processSessions"], json!("true"));
        assert_eq!(output["userId"], json!(""));
    }

    #[tokio::test]
    async fn test_empty_batch_and_missing_capability_fail_the_call() {
        let dispatch = dispatch_with(Arc::new(MockHandler::new()), false);

        let err = dispatch
            .dispatch("ga", Vec::new(), RequestContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);

        let err = dispatch
            .dispatch("unknown", vec![event("m1", json!({}))], RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_alternate_executor_compared_for_config_driven_destinations() {
        let mock = Arc::new(MockHandler::new());
        // null keys are ignored on both sides
        let expected = json!({
            "destinationId": "dest-1",
            "messageId": "m1",
            "config": {"key": "none"},
            "query": {},
            "userId": null
        });
        let executor = Arc::new(FixedExecutor {
            output: vec![expected],
            calls: AtomicU64::new(0),
        });

        let dispatch = dispatch_with(mock.clone(), true).with_alternate(executor.clone());
        let results = dispatch
            .dispatch("ga", vec![event("m1", json!({}))], RequestContext::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(executor.calls.load(Ordering::Relaxed), 1);
        assert_eq!(dispatch.metrics.snapshot().cdk_matched, 1);

        let diverging = Arc::new(FixedExecutor {
            output: vec![json!({"other": true})],
            calls: AtomicU64::new(0),
        });
        let dispatch = dispatch_with(mock, true).with_alternate(diverging);
        let results = dispatch
            .dispatch("ga", vec![event("m1", json!({}))], RequestContext::default())
            .await
            .unwrap();

        // handler output wins regardless of the comparison
        assert_eq!(results[0].output.as_ref().unwrap()["messageId"], json!("m1"));
        assert_eq!(dispatch.metrics.snapshot().cdk_mismatched, 1);
    }

    #[tokio::test]
    async fn test_alternate_executor_skipped_for_regular_destinations() {
        let executor = Arc::new(FixedExecutor {
            output: Vec::new(),
            calls: AtomicU64::new(0),
        });
        let dispatch = dispatch_with(Arc::new(MockHandler::new()), false)
            .with_alternate(executor.clone());

        dispatch
            .dispatch("ga", vec![event("m1", json!({}))], RequestContext::default())
            .await
            .unwrap();
        assert_eq!(executor.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_passthrough_resolver_keeps_templates() {
        let registry = HandlerRegistry::builder()
            .register(
                DestinationHandler::builder("ga")
                    .processor(Arc::new(MockHandler::new()))
                    .build(),
            )
            .build();
        assert!(registry.supports("ga", Capability::Process));
        let dispatch = ProcessorDispatch::new(
            Arc::new(registry),
            Arc::new(PassthroughResolver),
            Arc::new(Semaphore::new(1)),
            Arc::new(DispatchMetrics::new()),
        );

        let results = dispatch
            .dispatch("ga", vec![event("m1", json!({"key": "k"}))], RequestContext::default())
            .await
            .unwrap();
        assert_eq!(
            results[0].output.as_ref().unwrap()["config"]["key"],
            json!("{{ message.key || \"none\" }}")
        );
    }

    #[test]
    fn test_falsy_user_ids_become_empty_strings() {
        for falsy in [json!(""), json!(0), json!(false), json!(null)] {
            let out = normalize_user_id(json!({"userId": falsy}), ErrorStatusUserId::Preserve);
            assert_eq!(out["userId"], json!(""));
        }
        let out = normalize_user_id(json!({"event": "x"}), ErrorStatusUserId::Stringify);
        assert_eq!(out["userId"], json!(""));
    }

    #[test]
    fn test_truthy_user_ids_follow_policy() {
        let out = normalize_user_id(json!({"userId": 42}), ErrorStatusUserId::Preserve);
        assert_eq!(out["userId"], json!("42"));

        let errored = json!({"userId": 42, "statusCode": 400});
        assert_eq!(
            normalize_user_id(errored.clone(), ErrorStatusUserId::Preserve)["userId"],
            json!(42)
        );
        assert_eq!(
            normalize_user_id(errored, ErrorStatusUserId::Stringify)["userId"],
            json!("42")
        );
    }
}

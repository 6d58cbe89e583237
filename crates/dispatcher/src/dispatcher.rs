//! Dispatcher - every dispatch path behind one handle

use std::sync::Arc;

use contracts::{
    AlternateExecutor, BatchedRequest, DispatchConfig, DynamicConfigResolver, Event,
    JobStatusKind, PipelineConfig, PipelineError, ProxyEnvelope, RequestContext,
    RequestDescriptor, TransformResult,
};
use handler_registry::{HandlerRegistry, HandlerRegistryBuilder};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, instrument};

use crate::batch::BatchDispatch;
use crate::bulk::BulkDispatch;
use crate::error::DispatcherError;
use crate::http_network::HttpNetworkHandler;
use crate::metrics::{DispatchMetrics, DispatchMetricsSnapshot};
use crate::processor::ProcessorDispatch;
use crate::proxy::ProxyDispatch;
use crate::resolver::TemplateResolver;
use crate::router::RouterDispatch;

/// Builder for creating a Dispatcher
pub struct DispatcherBuilder {
    registry: HandlerRegistry,
    config: DispatchConfig,
    resolver: Arc<dyn DynamicConfigResolver>,
    alternate: Option<Arc<dyn AlternateExecutor>>,
}

impl DispatcherBuilder {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            config: DispatchConfig::default(),
            resolver: Arc::new(TemplateResolver),
            alternate: None,
        }
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default template resolver
    pub fn resolver(mut self, resolver: Arc<dyn DynamicConfigResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Executor compared against config-driven destinations
    pub fn alternate_executor(mut self, alternate: Arc<dyn AlternateExecutor>) -> Self {
        self.alternate = Some(alternate);
        self
    }

    #[instrument(name = "dispatcher_builder_build", skip(self))]
    pub fn build(self) -> Result<Dispatcher, DispatcherError> {
        if self.config.max_concurrency == 0 {
            return Err(DispatcherError::config("max_concurrency must be at least 1"));
        }

        let registry = Arc::new(self.registry);
        let metrics = Arc::new(DispatchMetrics::new());
        // shared by processor and router so one dispatcher never exceeds the cap
        let limiter = Arc::new(Semaphore::new(self.config.max_concurrency));

        let mut processor = ProcessorDispatch::new(
            Arc::clone(&registry),
            Arc::clone(&self.resolver),
            Arc::clone(&limiter),
            Arc::clone(&metrics),
        )
        .with_user_id_policy(self.config.error_status_user_id);
        if let Some(alternate) = self.alternate {
            processor = processor.with_alternate(alternate);
        }

        info!(
            handlers = registry.len(),
            max_concurrency = self.config.max_concurrency,
            "Dispatcher built"
        );

        Ok(Dispatcher {
            router: RouterDispatch::new(
                Arc::clone(&registry),
                Arc::clone(&self.resolver),
                limiter,
                Arc::clone(&metrics),
            ),
            batch: BatchDispatch::new(
                Arc::clone(&registry),
                self.resolver,
                Arc::clone(&metrics),
            ),
            proxy: ProxyDispatch::new(Arc::clone(&registry), Arc::clone(&metrics)),
            bulk: BulkDispatch::new(Arc::clone(&registry)),
            processor,
            registry,
            metrics,
        })
    }
}

/// Entry point for every call shape
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    processor: ProcessorDispatch,
    router: RouterDispatch,
    batch: BatchDispatch,
    proxy: ProxyDispatch,
    bulk: BulkDispatch,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn builder(registry: HandlerRegistry) -> DispatcherBuilder {
        DispatcherBuilder::new(registry)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Get snapshot of dispatch counters
    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn process(
        &self,
        destination: &str,
        events: Vec<Event>,
        request: RequestContext,
    ) -> Result<Vec<TransformResult>, PipelineError> {
        self.processor.dispatch(destination, events, request).await
    }

    pub async fn route(
        &self,
        destination: &str,
        events: Vec<Event>,
    ) -> Result<Vec<TransformResult>, PipelineError> {
        self.router.dispatch(destination, events).await
    }

    pub fn batch(
        &self,
        destination: &str,
        events: Vec<Event>,
    ) -> Result<Vec<BatchedRequest>, PipelineError> {
        self.batch.dispatch(destination, events)
    }

    pub async fn proxy(&self, destination: &str, request: RequestDescriptor) -> ProxyEnvelope {
        self.proxy.dispatch(destination, request).await
    }

    pub async fn file_upload(&self, destination: &str, request: Value) -> Result<Value, PipelineError> {
        self.bulk.file_upload(destination, request).await
    }

    pub async fn poll(&self, destination: &str, request: Value) -> Result<Value, PipelineError> {
        self.bulk.poll(destination, request).await
    }

    pub async fn fetch_job_status(
        &self,
        destination: &str,
        request: Value,
        kind: JobStatusKind,
    ) -> Result<Value, PipelineError> {
        self.bulk.fetch_job_status(destination, request, kind).await
    }

    pub async fn delete_users(&self, requests: Vec<Value>) -> Result<Vec<Value>, PipelineError> {
        self.bulk.delete_users(requests).await
    }
}

/// Build a dispatcher from pipeline configuration
///
/// Applies the configured aliases and config-driven destinations to the
/// registry and installs the HTTP network handler as proxy fallback.
#[instrument(name = "dispatcher_create", skip(config, registry))]
pub fn create_dispatcher(
    config: &PipelineConfig,
    registry: HandlerRegistryBuilder,
) -> Result<Dispatcher, DispatcherError> {
    let network = HttpNetworkHandler::from_config(&config.dispatch)?;
    let registry = registry
        .with_config(&config.registry)
        .fallback_network(Arc::new(network))
        .build();
    Dispatcher::builder(registry)
        .config(config.dispatch.clone())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{Destination, EventMetadata};
    use handler_registry::{DestinationHandler, MockHandler};
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn event(message_id: &str) -> Event {
        Event {
            message: json!({"userId": 7}),
            destination: Destination {
                id: "d1".into(),
                ..Default::default()
            },
            metadata: EventMetadata {
                message_id: message_id.into(),
                ..Default::default()
            },
            libraries: Vec::new(),
            request: None,
        }
    }

    #[tokio::test]
    async fn test_every_path_shares_one_registry() {
        let mock = Arc::new(MockHandler::new());
        let registry = HandlerRegistry::builder()
            .register(
                DestinationHandler::builder("braze")
                    .processor(mock.clone())
                    .router(mock.clone())
                    .batcher(mock.clone())
                    .network(mock.clone())
                    .build(),
            )
            .build();
        let dispatcher = Dispatcher::builder(registry).build().unwrap();

        let processed = dispatcher
            .process("braze", vec![event("m1")], RequestContext::default())
            .await
            .unwrap();
        assert_eq!(processed[0].output.as_ref().unwrap()["userId"], json!("7"));

        let routed = dispatcher.route("braze", vec![event("m2")]).await.unwrap();
        assert_eq!(routed.len(), 1);

        let batched = dispatcher.batch("braze", vec![event("m3")]).unwrap();
        assert_eq!(batched.len(), 1);

        let request: RequestDescriptor =
            serde_json::from_value(json!({"endpoint": "http://unused"})).unwrap();
        assert!(dispatcher.proxy("braze", request).await.is_success());

        let snapshot = dispatcher.metrics();
        assert_eq!(snapshot.events_in, 3);
        assert_eq!(snapshot.proxy_ok, 1);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = DispatchConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        let result = Dispatcher::builder(HandlerRegistry::default())
            .config(config)
            .build();
        assert!(matches!(result, Err(DispatcherError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_dispatcher_proxies_unregistered_destinations_over_http() {
        let server = MockServer::start();
        let endpoint = server.mock(|when, then| {
            when.method(POST).path("/v1/events");
            then.status(200).json_body(json!({"accepted": 1}));
        });

        let mut config = PipelineConfig::default();
        config.registry.aliases.insert("AMPLITUDE".into(), "am".into());
        let dispatcher = create_dispatcher(&config, HandlerRegistry::builder()).unwrap();

        let request: RequestDescriptor = serde_json::from_value(json!({
            "endpoint": server.url("/v1/events"),
            "body": {"JSON": {"events": []}}
        }))
        .unwrap();
        let envelope = dispatcher.proxy("webhook", request).await;

        endpoint.assert();
        assert_eq!(envelope.status(), 200);
        assert_eq!(
            envelope.output.message,
            "[Generic Response Handler] Request for destination: webhook Processed Successfully"
        );
        assert_eq!(dispatcher.registry().canonical_name("amplitude"), "am");
    }
}

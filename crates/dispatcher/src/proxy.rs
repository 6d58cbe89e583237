//! Proxy dispatch
//!
//! Forwards one pre-built request to the destination's network handler and
//! always answers with exactly one envelope. Transport failures, handler
//! rejections, routing errors and panics are all rendered as
//! `responseTransform` error envelopes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use contracts::{
    ErrorEnvelope, NetworkHandler, ProxyEnvelope, ProxyOutput, RequestDescriptor, TransformError,
    TransformerStage,
};
use futures::FutureExt;
use handler_registry::HandlerRegistry;
use observability::metrics as pipeline_metrics;
use tracing::{debug, error, instrument};

use crate::metrics::DispatchMetrics;

#[derive(Clone)]
pub struct ProxyDispatch {
    registry: Arc<HandlerRegistry>,
    metrics: Arc<DispatchMetrics>,
}

impl ProxyDispatch {
    pub fn new(registry: Arc<HandlerRegistry>, metrics: Arc<DispatchMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Perform the live call for `destination` and normalize the outcome
    #[instrument(
        name = "proxy_dispatch",
        skip(self, request),
        fields(destination = %destination, endpoint = %request.endpoint)
    )]
    pub async fn dispatch(&self, destination: &str, request: RequestDescriptor) -> ProxyEnvelope {
        let started = Instant::now();

        let outcome = match self.registry.network(destination) {
            Ok(network) => {
                AssertUnwindSafe(self.call(network.as_ref(), destination, &request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransformError::upstream(format!(
                            "network handler for {destination} panicked"
                        )))
                    })
            }
            Err(e) => Err(TransformError::new(e.status(), e.to_string())
                .as_response_transform_failure()),
        };

        let output = match outcome {
            Ok(output) => output,
            Err(e) => self.failure(destination, e),
        };

        self.metrics.inc_proxy((200..300).contains(&output.status));
        pipeline_metrics::record_total_proxy_latency(destination, output.status, started.elapsed());
        debug!(status = output.status, "proxy dispatch complete");
        ProxyEnvelope { output }
    }

    async fn call(
        &self,
        network: &dyn NetworkHandler,
        destination: &str,
        request: &RequestDescriptor,
    ) -> Result<ProxyOutput, TransformError> {
        let started = Instant::now();
        let raw = network
            .proxy(request)
            .await
            .map_err(|e| TransformError::new(e.status(), e.to_string()))?;
        pipeline_metrics::record_proxy_time(destination, started.elapsed());

        let normalized = network.process_response(&raw);
        network.handle_response(destination, normalized)
    }

    fn failure(&self, destination: &str, mut error: TransformError) -> ProxyOutput {
        if !error.response_transform_failure {
            error.message = format!(
                "[Error occurred while processing response for destination {destination}]: {}",
                error.message
            );
        }
        // an error envelope never reports success
        if error.status < 400 {
            error.status = 500;
        }
        error!(
            destination = %destination,
            status = error.status,
            error = %error.message,
            "proxy call failed"
        );
        pipeline_metrics::record_dest_transform_error(
            destination,
            TransformerStage::ResponseTransform,
            error.status,
        );
        ErrorEnvelope::from_error(&error, destination, TransformerStage::ResponseTransform).into()
    }
}

//! Shadow comparison around a dispatch call
//!
//! The legacy request starts before the primary call; the comparison runs
//! in a background task once the primary result is available. Nothing the
//! comparison does can alter, fail or delay the primary result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use contracts::ShadowConfig;
use observability::metrics as pipeline_metrics;
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::diff::{compare, ComparisonOutcome};
use crate::legacy::{HttpLegacyTarget, LegacyError, LegacyTarget, MirroredRequest};
use crate::normalize::Normalizer;

#[derive(Debug, Default)]
pub struct ComparisonStats {
    mirrored: AtomicU64,
    matched: AtomicU64,
    mismatched: AtomicU64,
    legacy_errors: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComparisonStatsSnapshot {
    pub mirrored: u64,
    pub matched: u64,
    pub mismatched: u64,
    pub legacy_errors: u64,
    pub skipped: u64,
}

impl ComparisonStats {
    pub fn snapshot(&self) -> ComparisonStatsSnapshot {
        ComparisonStatsSnapshot {
            mirrored: self.mirrored.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            mismatched: self.mismatched.load(Ordering::Relaxed),
            legacy_errors: self.legacy_errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct ShadowComparison<T> {
    target: Option<Arc<T>>,
    normalizer: Arc<Normalizer>,
    stats: Arc<ComparisonStats>,
    in_flight: Mutex<JoinSet<()>>,
}

impl ShadowComparison<HttpLegacyTarget> {
    /// Comparison against the configured legacy URL, disabled without one
    pub fn from_config(config: &ShadowConfig) -> Result<Self, LegacyError> {
        let normalizer = Normalizer::from_config(config);
        Ok(match HttpLegacyTarget::from_config(config)? {
            Some(target) => Self::new(target, normalizer),
            None => {
                error!("legacy url not configured, shadow comparison disabled");
                Self::disabled(normalizer)
            }
        })
    }
}

impl<T> ShadowComparison<T>
where
    T: LegacyTarget + Sync + 'static,
{
    pub fn new(target: T, normalizer: Normalizer) -> Self {
        Self::build(Some(Arc::new(target)), normalizer)
    }

    pub fn disabled(normalizer: Normalizer) -> Self {
        Self::build(None, normalizer)
    }

    fn build(target: Option<Arc<T>>, normalizer: Normalizer) -> Self {
        Self {
            target,
            normalizer: Arc::new(normalizer),
            stats: Arc::new(ComparisonStats::default()),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub fn stats(&self) -> ComparisonStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run `primary`, comparing its successful result against the legacy
    /// implementation in the background
    ///
    /// The primary result is returned as produced. Failed primary calls
    /// are not compared.
    pub async fn wrap<F, E>(&self, request: MirroredRequest, primary: F) -> Result<Value, E>
    where
        F: Future<Output = Result<Value, E>>,
    {
        let Some(target) = &self.target else {
            return primary.await;
        };
        if !self.normalizer.is_compared(&request.path) {
            debug!(path = %request.path, "route not compared");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return primary.await;
        }

        self.stats.mirrored.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(request);
        let legacy: JoinHandle<Result<Value, LegacyError>> = {
            let target = Arc::clone(target);
            let request = Arc::clone(&request);
            tokio::spawn(async move { target.fetch(&request).await })
        };

        let result = primary.await;
        match &result {
            Ok(response) => self.spawn_comparison(request, legacy, response.clone()),
            Err(_) => {
                debug!(path = %request.path, "primary call failed, comparison skipped");
                legacy.abort();
            }
        }
        result
    }

    fn spawn_comparison(
        &self,
        request: Arc<MirroredRequest>,
        legacy: JoinHandle<Result<Value, LegacyError>>,
        primary: Value,
    ) {
        let normalizer = Arc::clone(&self.normalizer);
        let stats = Arc::clone(&self.stats);
        let task = async move {
            let legacy = match legacy.await {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    error!(path = %request.path, error = %e, "failed to reach legacy implementation");
                    stats.legacy_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    error!(path = %request.path, error = %e, "legacy request task aborted");
                    stats.legacy_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let outcome = compare_payloads(&normalizer, &request, legacy, primary);
            let counter = if outcome.matched {
                &stats.matched
            } else {
                &stats.mismatched
            };
            counter.fetch_add(1, Ordering::Relaxed);
        };

        let Ok(mut in_flight) = self.in_flight.lock() else {
            warn!("comparison task set poisoned, comparison dropped");
            return;
        };
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(task);
    }

    /// Wait for every comparison started so far
    pub async fn drain(&self) {
        let mut pending = match self.in_flight.lock() {
            Ok(mut in_flight) => std::mem::take(&mut *in_flight),
            Err(_) => return,
        };
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "comparison task failed");
            }
        }
        info!(stats = ?self.stats.snapshot(), "shadow comparisons drained");
    }
}

/// Normalize both sides for the route and diff them, recording the result
pub fn compare_payloads(
    normalizer: &Normalizer,
    request: &MirroredRequest,
    legacy: Value,
    primary: Value,
) -> ComparisonOutcome {
    let path = request.path.as_str();
    let legacy = normalizer.normalize(path, legacy);
    let primary = normalizer.normalize(path, primary);
    let outcome = compare(&legacy, &primary);

    let method = request.method.as_str().to_lowercase();
    pipeline_metrics::record_payload_match(path, &method, outcome.matched);
    if let Some(diff) = &outcome.diff {
        error!(
            path = %request.url(),
            method = %request.method,
            body = %request.body,
            primary = %primary,
            legacy = %legacy,
            diff = %diff,
            "payload mismatch against legacy implementation"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    /// Answers every request with a fixed body, or fails
    struct FixedTarget {
        body: Option<Value>,
        delay: Duration,
    }

    impl LegacyTarget for FixedTarget {
        async fn fetch(&self, request: &MirroredRequest) -> Result<Value, LegacyError> {
            tokio::time::sleep(self.delay).await;
            self.body.clone().ok_or_else(|| LegacyError::Status {
                url: request.url(),
                status: 503,
            })
        }
    }

    fn shadow(body: Option<Value>, delay: Duration) -> ShadowComparison<FixedTarget> {
        ShadowComparison::new(
            FixedTarget { body, delay },
            Normalizer::from_config(&ShadowConfig::default()),
        )
    }

    fn ga_result(qt: u64) -> Value {
        json!([{"output": {"params": {"qt": qt, "ea": "click"}}, "metadata": {"messageId": "m1"}, "statusCode": 200}])
    }

    #[tokio::test]
    async fn test_match_ignores_registered_timestamp() {
        let shadow = shadow(Some(ga_result(100)), Duration::ZERO);

        let result: Result<Value, ()> = shadow
            .wrap(MirroredRequest::post("/v0/ga", json!([])), async {
                Ok(ga_result(200))
            })
            .await;
        shadow.drain().await;

        assert_eq!(result.unwrap(), ga_result(200));
        let stats = shadow.stats();
        assert_eq!(stats.mirrored, 1);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.mismatched, 0);
    }

    #[tokio::test]
    async fn test_mismatch_is_counted_but_response_untouched() {
        let shadow = shadow(Some(json!([{"output": {"a": 1}}])), Duration::ZERO);

        let result: Result<Value, ()> = shadow
            .wrap(MirroredRequest::post("/v0/am", json!([])), async {
                Ok(json!([{"output": {"a": 2}}]))
            })
            .await;
        shadow.drain().await;

        assert_eq!(result.unwrap(), json!([{"output": {"a": 2}}]));
        assert_eq!(shadow.stats().mismatched, 1);
    }

    #[tokio::test]
    async fn test_slow_or_failing_legacy_never_delays_primary() {
        let slow = shadow(Some(json!([])), Duration::from_secs(30));
        let result: Result<Value, ()> = tokio::time::timeout(
            Duration::from_secs(1),
            slow.wrap(MirroredRequest::post("/v0/am", json!([])), async { Ok(json!([])) }),
        )
        .await
        .unwrap();
        assert_eq!(result.unwrap(), json!([]));

        let failing = shadow(None, Duration::ZERO);
        let result: Result<Value, ()> = failing
            .wrap(MirroredRequest::post("/v0/am", json!([])), async { Ok(json!([1])) })
            .await;
        failing.drain().await;
        assert_eq!(result.unwrap(), json!([1]));
        assert_eq!(failing.stats().legacy_errors, 1);
    }

    #[tokio::test]
    async fn test_primary_error_passes_through_uncompared() {
        let shadow = shadow(Some(json!([])), Duration::ZERO);

        let result = shadow
            .wrap(MirroredRequest::post("/v0/am", json!([])), async {
                Err::<Value, _>("unknown destination")
            })
            .await;
        shadow.drain().await;

        assert_eq!(result.unwrap_err(), "unknown destination");
        let stats = shadow.stats();
        assert_eq!(stats.matched + stats.mismatched + stats.legacy_errors, 0);
    }

    #[tokio::test]
    async fn test_disabled_and_excluded_routes_skip_legacy() {
        let disabled: ShadowComparison<FixedTarget> =
            ShadowComparison::disabled(Normalizer::from_config(&ShadowConfig::default()));
        assert!(!disabled.is_enabled());
        let result: Result<Value, ()> = disabled
            .wrap(MirroredRequest::post("/v0/am", json!([])), async { Ok(json!("ok")) })
            .await;
        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(disabled.stats(), ComparisonStatsSnapshot::default());

        let shadow = shadow(Some(json!([])), Duration::ZERO);
        let _: Result<Value, ()> = shadow
            .wrap(MirroredRequest::post("/v0/sources/webhook", json!({})), async {
                Ok(json!([]))
            })
            .await;
        assert_eq!(shadow.stats().skipped, 1);
        assert_eq!(shadow.stats().mirrored, 0);
    }

    #[test]
    fn test_from_config_without_legacy_url_is_disabled() {
        let shadow = ShadowComparison::from_config(&ShadowConfig::default()).unwrap();
        assert!(!shadow.is_enabled());
    }
}

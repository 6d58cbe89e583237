//! Per-dispatcher counters for observability

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every dispatch path of one dispatcher
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Events accepted by processor, router and batch dispatch
    events_in: AtomicU64,
    /// Successful result records
    results_ok: AtomicU64,
    /// Failed result records (events or groups)
    results_failed: AtomicU64,
    /// Destination-instance groups built by router and batch dispatch
    groups: AtomicU64,
    /// Proxy calls answered with a 2xx envelope
    proxy_ok: AtomicU64,
    /// Proxy calls answered with an error envelope
    proxy_failed: AtomicU64,
    /// Alternate executor comparisons that matched
    cdk_matched: AtomicU64,
    /// Alternate executor comparisons that differed or failed
    cdk_mismatched: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_events_in(&self, count: usize) {
        self.events_in.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_results_ok(&self, count: usize) {
        self.results_ok.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_results_failed(&self) {
        self.results_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_groups(&self, count: usize) {
        self.groups.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_proxy(&self, success: bool) {
        let counter = if success {
            &self.proxy_ok
        } else {
            &self.proxy_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cdk(&self, matched: bool) {
        let counter = if matched {
            &self.cdk_matched
        } else {
            &self.cdk_mismatched
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            events_in: self.events_in.load(Ordering::Relaxed),
            results_ok: self.results_ok.load(Ordering::Relaxed),
            results_failed: self.results_failed.load(Ordering::Relaxed),
            groups: self.groups.load(Ordering::Relaxed),
            proxy_ok: self.proxy_ok.load(Ordering::Relaxed),
            proxy_failed: self.proxy_failed.load(Ordering::Relaxed),
            cdk_matched: self.cdk_matched.load(Ordering::Relaxed),
            cdk_mismatched: self.cdk_mismatched.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatch counters (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMetricsSnapshot {
    pub events_in: u64,
    pub results_ok: u64,
    pub results_failed: u64,
    pub groups: u64,
    pub proxy_ok: u64,
    pub proxy_failed: u64,
    pub cdk_matched: u64,
    pub cdk_mismatched: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = DispatchMetrics::new();
        metrics.add_events_in(3);
        metrics.add_results_ok(2);
        metrics.inc_results_failed();
        metrics.inc_proxy(false);
        metrics.inc_cdk(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_in, 3);
        assert_eq!(snapshot.results_ok, 2);
        assert_eq!(snapshot.results_failed, 1);
        assert_eq!(snapshot.proxy_failed, 1);
        assert_eq!(snapshot.proxy_ok, 0);
        assert_eq!(snapshot.cdk_matched, 1);
    }
}

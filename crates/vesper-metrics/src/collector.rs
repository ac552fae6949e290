// Copyright 2026 Vesper Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::registry::{HandlerStyle, MetricsRegistry, RequestOutcome};
use crate::snapshot::MetricsSnapshot;
use std::sync::Arc;
use std::time::Instant;
use vesper_common::PoolStats;

/// Recording interface used by the request path.
///
/// The runtime only talks to this trait, so a server can swap in a
/// different sink (or a no-op one in benchmarks) without touching dispatch.
///
/// # Example
///
/// ```rust
/// use vesper_metrics::{MetricsCollector, RequestOutcome, RuntimeMetricsCollector};
/// use std::time::Instant;
///
/// let collector = RuntimeMetricsCollector::new();
/// let start = Instant::now();
/// collector.begin_request();
/// collector.record_request(None, RequestOutcome::NotReady, start);
/// ```
pub trait MetricsCollector: Send + Sync {
    /// Marks a request as in flight.
    fn begin_request(&self);

    /// Records a finished request with its outcome and latency.
    ///
    /// `style` is `None` when the request never reached a handler.
    fn record_request(&self, style: Option<HandlerStyle>, outcome: RequestOutcome, start: Instant);

    /// Records the result of a reload attempt.
    fn record_reload(&self, success: bool);

    /// Returns shared counters for a named object pool.
    fn pool_stats(&self, name: &str) -> Arc<PoolStats>;

    /// Takes a snapshot of the current metrics state.
    fn snapshot(&self) -> MetricsSnapshot;

    /// Milliseconds since the collector was created.
    fn uptime_ms(&self) -> u64;
}

/// Collector backed by a [`MetricsRegistry`].
#[derive(Debug, Clone)]
pub struct RuntimeMetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl RuntimeMetricsCollector {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(MetricsRegistry::new()))
    }

    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }
}

impl Default for RuntimeMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector for RuntimeMetricsCollector {
    fn begin_request(&self) {
        self.registry.request_started();
    }

    fn record_request(&self, style: Option<HandlerStyle>, outcome: RequestOutcome, start: Instant) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.registry.request_finished(style, outcome, latency_us);
    }

    fn record_reload(&self, success: bool) {
        self.registry.record_reload(success);
    }

    fn pool_stats(&self, name: &str) -> Arc<PoolStats> {
        self.registry.pool_stats(name)
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    fn uptime_ms(&self) -> u64 {
        self.registry.uptime_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_collectors_are_isolated() {
        let a = RuntimeMetricsCollector::new();
        let b = RuntimeMetricsCollector::new();

        a.begin_request();
        a.record_request(Some(HandlerStyle::Middleware), RequestOutcome::Responded, Instant::now());

        assert_eq!(a.snapshot().total_requests, 1);
        assert_eq!(b.snapshot().total_requests, 0);
    }

    #[test]
    fn test_clones_share_registry() {
        let a = RuntimeMetricsCollector::new();
        let b = a.clone();
        b.record_reload(true);
        assert_eq!(a.snapshot().reloads.succeeded, 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let collector = Arc::new(RuntimeMetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..500 {
                        collector.begin_request();
                        collector.record_request(
                            Some(HandlerStyle::Event),
                            RequestOutcome::Fallthrough,
                            Instant::now(),
                        );
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 4000);
        assert_eq!(snapshot.successful_requests, 4000);
        assert_eq!(snapshot.active_requests, 0);
        assert_eq!(snapshot.latency.samples, 4000);
    }
}

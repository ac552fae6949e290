use crate::snapshot::{LatencySummary, MetricsSnapshot, ReloadMetrics};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use vesper_common::PoolStats;

const NUM_HISTOGRAM_BINS: usize = 100;

/// The two script-facing handler shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerStyle {
    Middleware,
    Event,
}

impl HandlerStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerStyle::Middleware => "middleware",
            HandlerStyle::Event => "event",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// How a dispatched request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
    /// The script produced the response.
    Responded,
    /// The script handed the request to the fallthrough collaborator.
    Fallthrough,
    /// The script threw or rejected and an error response was written.
    ScriptError,
    /// No shard was installed yet.
    NotReady,
    /// The shard has no registered handler.
    NoHandler,
    /// The shard was stopped before the request completed.
    Interrupted,
    /// The inbound request was cancelled while waiting on the script.
    Cancelled,
}

impl RequestOutcome {
    const ALL: [RequestOutcome; 7] = [
        RequestOutcome::Responded,
        RequestOutcome::Fallthrough,
        RequestOutcome::ScriptError,
        RequestOutcome::NotReady,
        RequestOutcome::NoHandler,
        RequestOutcome::Interrupted,
        RequestOutcome::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Responded => "responded",
            RequestOutcome::Fallthrough => "fallthrough",
            RequestOutcome::ScriptError => "script_error",
            RequestOutcome::NotReady => "not_ready",
            RequestOutcome::NoHandler => "no_handler",
            RequestOutcome::Interrupted => "interrupted",
            RequestOutcome::Cancelled => "cancelled",
        }
    }

    /// Whether the outcome counts as a successful request.
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Responded | RequestOutcome::Fallthrough)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Logarithmic latency histogram.
///
/// Ten bins per decade from 1µs upward; everything at or above the last
/// decade lands in the final bin. Recording is a handful of relaxed atomic
/// adds.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn bin_for(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        let leading = (latency_us / 10u64.pow(decade as u32)) as usize;
        (decade * 10 + leading.min(9)).min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Lower bound of a bin, in microseconds.
    fn bin_floor(bin: usize) -> u64 {
        let decade = (bin / 10).min(19) as u32;
        10u64.saturating_pow(decade) * (bin % 10).max(1) as u64
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = (total * percentile).div_ceil(100).max(1);
        let mut seen = 0;
        for (idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if seen + count >= target {
                let start = Self::bin_floor(idx);
                let end = Self::bin_floor(idx + 1).max(start + 1);
                let fraction = (target - seen) as f64 / count as f64;
                return start + ((end - start) as f64 * fraction) as u64;
            }
            seen += count;
        }

        Self::bin_floor(NUM_HISTOGRAM_BINS - 1)
    }

    fn summary(&self) -> LatencySummary {
        let samples = self.sample_count.load(Ordering::Relaxed);
        if samples == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            samples,
            avg_us: self.total_latency.load(Ordering::Relaxed) / samples,
            p50_us: self.percentile(50),
            p95_us: self.percentile(95),
            p99_us: self.percentile(99),
        }
    }
}

/// Storage for every runtime metric.
///
/// Counter updates use relaxed atomics; snapshots are best-effort and may
/// observe counters from slightly different instants.
#[derive(Debug)]
pub struct MetricsRegistry {
    started: Instant,
    total_requests: AtomicU64,
    active_requests: AtomicU64,
    outcomes: [AtomicU64; RequestOutcome::ALL.len()],
    styles: [AtomicU64; 2],
    latencies: LatencyHistogram,
    reloads_succeeded: AtomicU64,
    reloads_failed: AtomicU64,
    pools: RwLock<BTreeMap<String, Arc<PoolStats>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
            styles: std::array::from_fn(|_| AtomicU64::new(0)),
            latencies: LatencyHistogram::new(),
            reloads_succeeded: AtomicU64::new(0),
            reloads_failed: AtomicU64::new(0),
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(
        &self,
        style: Option<HandlerStyle>,
        outcome: RequestOutcome,
        latency_us: u64,
    ) {
        // Saturating: a finish without a start must not wrap the gauge.
        let _ = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
        if let Some(style) = style {
            self.styles[style.index()].fetch_add(1, Ordering::Relaxed);
        }
        self.latencies.record(latency_us);
    }

    pub fn record_reload(&self, success: bool) {
        if success {
            self.reloads_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the counters for the named pool, creating them on first use.
    pub fn pool_stats(&self, name: &str) -> Arc<PoolStats> {
        if let Some(stats) = self.pools.read().get(name) {
            return Arc::clone(stats);
        }
        Arc::clone(
            self.pools
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(PoolStats::new())),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let outcomes = RequestOutcome::ALL
            .iter()
            .map(|o| (o.as_str().to_string(), self.outcomes[o.index()].load(Ordering::Relaxed)))
            .collect::<BTreeMap<_, _>>();
        let successful_requests = RequestOutcome::ALL
            .iter()
            .filter(|o| o.is_success())
            .map(|o| self.outcomes[o.index()].load(Ordering::Relaxed))
            .sum();
        let total_requests = self.total_requests.load(Ordering::Relaxed);

        let styles = [HandlerStyle::Middleware, HandlerStyle::Event]
            .iter()
            .map(|s| (s.as_str().to_string(), self.styles[s.index()].load(Ordering::Relaxed)))
            .collect();

        let pools = self
            .pools
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        MetricsSnapshot {
            total_requests,
            successful_requests,
            failed_requests: total_requests.saturating_sub(successful_requests),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            outcomes,
            styles,
            latency: self.latencies.summary(),
            reloads: ReloadMetrics {
                succeeded: self.reloads_succeeded.load(Ordering::Relaxed),
                failed: self.reloads_failed.load(Ordering::Relaxed),
            },
            pools,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

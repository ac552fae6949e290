//! Vesper Metrics Collection
//!
//! Thread-safe, allocation-free metrics for the vesper runtime. Nothing in
//! this crate is process-global: a [`MetricsRegistry`] is created by whoever
//! owns the runtime and injected into the fleet, the pools and the HTTP
//! server, so tests can run isolated instances side by side.
//!
//! # Components
//!
//! - [`MetricsRegistry`]: atomic counters, a latency histogram and the set of
//!   named pool counters
//! - [`MetricsCollector`]: the recording interface used by the request path
//! - [`MetricsSnapshot`] / [`ServerInfo`]: serializable views served by the
//!   admin endpoints
//!
//! # Example
//!
//! ```rust
//! use vesper_metrics::{HandlerStyle, MetricsCollector, RequestOutcome, RuntimeMetricsCollector};
//! use std::time::Instant;
//!
//! let collector = RuntimeMetricsCollector::new();
//! let start = Instant::now();
//! collector.record_request(Some(HandlerStyle::Middleware), RequestOutcome::Responded, start);
//! assert_eq!(collector.snapshot().total_requests, 1);
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::{MetricsCollector, RuntimeMetricsCollector};
pub use registry::{HandlerStyle, MetricsRegistry, RequestOutcome};
pub use snapshot::{LatencySummary, MetricsSnapshot, ReloadMetrics, ServerInfo};

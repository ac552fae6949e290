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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vesper_common::PoolStatsSnapshot;

/// Server information served by the `info` admin endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub version: String,
    pub uptime_ms: u64,
    pub shards: usize,
    /// Name of the script currently installed, if any
    pub script: Option<String>,
    /// Number of successful reloads since start
    pub generation: u64,
}

impl ServerInfo {
    pub fn new(uptime_ms: u64, shards: usize, script: Option<String>, generation: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
            shards,
            script,
            generation,
        }
    }
}

/// Latency percentiles in microseconds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatencySummary {
    pub samples: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Reload attempt counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadMetrics {
    pub succeeded: u64,
    pub failed: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_requests: u64,
    pub uptime_ms: u64,
    pub outcomes: BTreeMap<String, u64>,
    pub styles: BTreeMap<String, u64>,
    pub latency: LatencySummary,
    pub reloads: ReloadMetrics,
    pub pools: BTreeMap<String, PoolStatsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_carries_crate_version() {
        let info = ServerInfo::new(10, 4, Some("main.js".into()), 2);
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(info.shards, 4);
    }

    #[test]
    fn test_snapshot_serializes_nested_maps() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.outcomes.insert("responded".into(), 3);
        snapshot.pools.insert("facade".into(), PoolStatsSnapshot { created: 1, ..Default::default() });

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["outcomes"]["responded"], 3);
        assert_eq!(json["pools"]["facade"]["created"], 1);
        assert_eq!(json["latency"]["p99_us"], 0);
    }
}

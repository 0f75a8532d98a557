use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// [`Timer`] is used to record the processing time of one request.
pub struct Timer {
    session_started: SystemTime,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            session_started: SystemTime::now(),
        }
    }

    pub fn read(self) -> Result<Duration> {
        self.session_started
            .elapsed()
            .with_context(|| "Failed to read elapsed time")
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RequestType {
    Ingest,
    Search,
    Ask,
    Themes,
    Synthesize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerRequestMetricData {
    pub kind: RequestType,
    pub time_cost: Duration,
    pub store_memory_usage: usize,
    pub process_memory_usage: usize,
}

/// Per-request metrics for one benchmarking session; the index of the
/// vector is the request id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricData {
    pub request_metrics: Vec<PerRequestMetricData>,
}

#[derive(Default)]
pub struct Metrics {
    metric_store: MetricData,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.metric_store.request_metrics.clear();
    }

    pub fn add_metric(&mut self, kind: RequestType, store_memory_usage: usize, time_cost: Duration) {
        self.metric_store.request_metrics.push(PerRequestMetricData {
            kind,
            time_cost,
            store_memory_usage,
            process_memory_usage: get_current_memory()
                .map(|m| m.physical_mem)
                .unwrap_or_default(),
        });
    }

    pub fn get_metrics(&self) -> &MetricData {
        &self.metric_store
    }
}

pub fn get_current_memory() -> Option<memory_stats::MemoryStats> {
    memory_stats::memory_stats()
}

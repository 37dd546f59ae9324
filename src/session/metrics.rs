//! Rolling latency samples and the periodically recomputed snapshot.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

use crate::textutil::now_unix_millis;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    fn from_samples(samples: &VecDeque<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let total: f64 = sorted.iter().sum();
        Self {
            samples: sorted.len(),
            avg_ms: total / sorted.len() as f64,
            p95_ms: nearest_rank(&sorted, 95),
            p99_ms: nearest_rank(&sorted, 99),
            max_ms: sorted.last().copied().unwrap_or_default(),
        }
    }
}

/// Nearest-rank percentile over ascending `sorted`, which must be non-empty.
fn nearest_rank(sorted: &[f64], percentile: usize) -> f64 {
    let rank = (percentile * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub command_latency: LatencyStats,
    pub capture_latency: LatencyStats,
    pub total_commands: u64,
    pub failed_commands: u64,
    /// Failed destroy, send and capture calls.
    pub failed_operations: u64,
    pub success_rate: f64,
    pub latency_alerts: u64,
    /// Unix millis of the recomputation; zero before the first one.
    pub computed_at_ms: u64,
}

#[derive(Debug)]
pub struct PerformanceTracker {
    max_samples: usize,
    latency_target: Duration,
    command: VecDeque<Duration>,
    capture: VecDeque<Duration>,
    total_commands: u64,
    failed_commands: u64,
    failed_operations: u64,
    latency_alerts: u64,
    snapshot: PerformanceMetrics,
}

impl PerformanceTracker {
    pub fn new(max_samples: usize, latency_target: Duration) -> Self {
        Self {
            max_samples: max_samples.max(1),
            latency_target,
            command: VecDeque::new(),
            capture: VecDeque::new(),
            total_commands: 0,
            failed_commands: 0,
            failed_operations: 0,
            latency_alerts: 0,
            snapshot: PerformanceMetrics {
                success_rate: 1.0,
                ..PerformanceMetrics::default()
            },
        }
    }

    fn push(samples: &mut VecDeque<Duration>, max: usize, latency: Duration) {
        if samples.len() == max {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    pub fn record_command(&mut self, latency: Duration, success: bool) {
        self.total_commands += 1;
        if success {
            Self::push(&mut self.command, self.max_samples, latency);
        } else {
            self.failed_commands += 1;
        }
    }

    pub fn record_capture(&mut self, latency: Duration) {
        Self::push(&mut self.capture, self.max_samples, latency);
    }

    pub fn record_failure(&mut self) {
        self.failed_operations += 1;
    }

    /// Recompute the snapshot from the current samples.
    pub fn recompute(&mut self) -> PerformanceMetrics {
        let command_latency = LatencyStats::from_samples(&self.command);
        let target_ms = self.latency_target.as_secs_f64() * 1000.0;
        if command_latency.samples > 0 && command_latency.avg_ms > target_ms {
            self.latency_alerts += 1;
            warn!(
                avg_ms = command_latency.avg_ms,
                target_ms, "average command latency above target"
            );
        }
        let success_rate = if self.total_commands == 0 {
            1.0
        } else {
            (self.total_commands - self.failed_commands) as f64 / self.total_commands as f64
        };
        self.snapshot = PerformanceMetrics {
            command_latency,
            capture_latency: LatencyStats::from_samples(&self.capture),
            total_commands: self.total_commands,
            failed_commands: self.failed_commands,
            failed_operations: self.failed_operations,
            success_rate,
            latency_alerts: self.latency_alerts,
            computed_at_ms: now_unix_millis(),
        };
        self.snapshot.clone()
    }

    /// The last recomputed snapshot.
    pub fn snapshot(&self) -> PerformanceMetrics {
        self.snapshot.clone()
    }
}

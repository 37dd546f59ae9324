//! FIFO command queue with latency-adaptive throttling.
//!
//! One worker drains the queue in submission order. While the recent average
//! latency stays under the configured floor the next job starts at once;
//! otherwise the worker pauses `throttle_delay_ms` between jobs.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::backend::{BackendManager, BatchOutcome};
use crate::config::IntegrationConfig;
use crate::error::MuxError;
use crate::session::CommandExecution;
use crate::textutil::now_unix_millis;

const LATENCY_WINDOW: usize = 20;

pub(crate) struct Job {
    pub session_id: String,
    pub pane_id: Option<String>,
    pub commands: Vec<String>,
    pub reply: oneshot::Sender<Result<Vec<CommandExecution>, MuxError>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processed: u64,
    pub throttled: u64,
    pub recent_avg_latency_ms: f64,
}

#[derive(Default)]
pub(crate) struct QueueShared {
    history: Mutex<VecDeque<CommandExecution>>,
    latencies: Mutex<VecDeque<Duration>>,
    pending: AtomicUsize,
    processed: AtomicU64,
    throttled: AtomicU64,
}

impl QueueShared {
    pub fn history(&self) -> Vec<CommandExecution> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            throttled: self.throttled.load(Ordering::Acquire),
            recent_avg_latency_ms: self.recent_average().as_secs_f64() * 1000.0,
        }
    }

    pub fn enqueued(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn recent_average(&self) -> Duration {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    }

    fn record_latency(&self, latency: Duration) {
        let mut latencies = self.latencies.lock();
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency);
    }

    fn remember(&self, limit: usize, executions: impl IntoIterator<Item = CommandExecution>) {
        let limit = limit.max(1);
        let mut history = self.history.lock();
        for execution in executions {
            if history.len() == limit {
                history.pop_front();
            }
            history.push_back(execution);
        }
    }
}

pub(crate) fn spawn_worker(
    backends: Arc<BackendManager>,
    config: IntegrationConfig,
    shared: Arc<QueueShared>,
    rx: mpsc::Receiver<Job>,
) -> JoinHandle<()> {
    tokio::spawn(run(backends, config, shared, rx))
}

async fn run(
    backends: Arc<BackendManager>,
    config: IntegrationConfig,
    shared: Arc<QueueShared>,
    mut rx: mpsc::Receiver<Job>,
) {
    let floor = Duration::from_millis(config.latency_floor_ms);
    let throttle = Duration::from_millis(config.throttle_delay_ms);
    while let Some(job) = rx.recv().await {
        shared.pending.fetch_sub(1, Ordering::AcqRel);
        let started = Instant::now();
        let outcome = process(&backends, &job).await;
        let elapsed = started.elapsed();
        shared.record_latency(elapsed / job.commands.len().max(1) as u32);
        shared.processed.fetch_add(1, Ordering::AcqRel);

        let mut recorded = outcome.executions.clone();
        if let Some(e) = &outcome.error {
            recorded.push(failed_execution(&job, recorded.len(), e));
        }
        shared.remember(config.history_limit, recorded);
        if job.reply.send(outcome.into_result()).is_err() {
            trace!(session = %job.session_id, "submitter went away before reply");
        }

        if !throttle.is_zero() && shared.recent_average() >= floor {
            shared.throttled.fetch_add(1, Ordering::AcqRel);
            tokio::time::sleep(throttle).await;
        }
    }
    debug!("command queue drained");
}

async fn process(backends: &BackendManager, job: &Job) -> BatchOutcome {
    match job.commands.as_slice() {
        [command] => match backends
            .execute_command(&job.session_id, command, job.pane_id.as_deref())
            .await
        {
            Ok(execution) => BatchOutcome {
                executions: vec![execution],
                error: None,
            },
            Err(e) => BatchOutcome::failed(e),
        },
        commands => backends.execute_batch(&job.session_id, commands).await,
    }
}

/// History entry for the command at `index`, the one that stopped the job.
fn failed_execution(job: &Job, index: usize, error: &MuxError) -> CommandExecution {
    CommandExecution {
        session_id: job.session_id.clone(),
        window_id: None,
        pane_id: job.pane_id.clone(),
        command: job.commands.get(index).cloned().unwrap_or_default(),
        submitted_at_ms: now_unix_millis(),
        execution_time: Duration::ZERO,
        output: None,
        error: Some(error.to_string()),
    }
}

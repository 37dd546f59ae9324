//! Adaptive batching of control-mode commands.
//!
//! Callers submit the invocations of one operation and await its combined
//! output. A dispatcher task collects submissions until the batch is full or
//! the wait window closes, then sends the whole batch over one pooled
//! connection in a single round trip. At most `max_concurrent_batches`
//! batches are in flight.
//!
//! With `adaptive` set, each completed batch tunes the window: above the
//! latency threshold the wait halves and the size shrinks, below half the
//! threshold both grow back, never past the configured `max_batch_size`
//! items or `max_batch_wait`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BatcherConfig;
use crate::error::MuxError;
use crate::tmux::ControlReply;

use super::pool::ConnectionPool;

const MIN_WAIT_STEP: Duration = Duration::from_micros(250);

/// Notifications emitted by the batcher.
#[derive(Debug, Clone, PartialEq)]
pub enum BatcherEvent {
    BatchCompleted {
        /// Submissions in the batch.
        size: usize,
        /// Invocations sent in the round trip.
        commands: usize,
        elapsed: Duration,
        /// Mean time from submission to reply across the batch.
        avg_command_latency: Duration,
    },
    WindowAdjusted {
        batch_size: usize,
        wait: Duration,
    },
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct BatcherMetrics {
    pub batches: u64,
    pub items: u64,
    pub commands: u64,
    pub failed_batches: u64,
    pub avg_batch_size: f64,
    pub avg_batch_latency_ms: f64,
    pub current_batch_size: usize,
    pub current_wait_us: u64,
}

struct BatchItem {
    commands: Vec<Vec<String>>,
    reply: oneshot::Sender<Result<String, MuxError>>,
    enqueued: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    size: usize,
    wait: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    items: AtomicU64,
    commands: AtomicU64,
    failed_batches: AtomicU64,
    batch_micros: AtomicU64,
}

struct Shared {
    pool: ConnectionPool,
    config: BatcherConfig,
    command_timeout: Duration,
    window: Mutex<Window>,
    batch_slots: Arc<Semaphore>,
    counters: Counters,
    events: Option<mpsc::UnboundedSender<BatcherEvent>>,
}

pub struct CommandBatcher {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<BatchItem>,
    cancel: CancellationToken,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl CommandBatcher {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn new(
        pool: ConnectionPool,
        config: BatcherConfig,
        command_timeout: Duration,
        events: Option<mpsc::UnboundedSender<BatcherEvent>>,
    ) -> Self {
        let window = Window {
            size: config.max_batch_size.max(1),
            wait: Duration::from_millis(config.max_batch_wait_ms),
        };
        let shared = Arc::new(Shared {
            pool,
            batch_slots: Arc::new(Semaphore::new(config.max_concurrent_batches.max(1))),
            config,
            command_timeout,
            window: Mutex::new(window),
            counters: Counters::default(),
            events,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(shared.clone(), rx, cancel.clone()));
        Self {
            shared,
            tx,
            cancel,
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Submit the invocations of one operation; resolves with their joined
    /// output, or the first failing reply.
    pub async fn execute(&self, commands: Vec<Vec<String>>) -> Result<String, MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Shutdown);
        }
        if commands.is_empty() {
            return Ok(String::new());
        }
        let (reply, rx) = oneshot::channel();
        let item = BatchItem {
            commands,
            reply,
            enqueued: Instant::now(),
        };
        self.tx.send(item).map_err(|_| MuxError::Shutdown)?;
        rx.await.unwrap_or(Err(MuxError::Shutdown))
    }

    /// Current `(batch size, wait window)`.
    pub fn current_window(&self) -> (usize, Duration) {
        let window = *self.shared.window.lock();
        (window.size, window.wait)
    }

    pub fn metrics(&self) -> BatcherMetrics {
        let counters = &self.shared.counters;
        let batches = counters.batches.load(Ordering::Relaxed);
        let items = counters.items.load(Ordering::Relaxed);
        let micros = counters.batch_micros.load(Ordering::Relaxed);
        let (size, wait) = self.current_window();
        let per_batch = |total: f64| {
            if batches == 0 {
                0.0
            } else {
                total / batches as f64
            }
        };
        BatcherMetrics {
            batches,
            items,
            commands: counters.commands.load(Ordering::Relaxed),
            failed_batches: counters.failed_batches.load(Ordering::Relaxed),
            avg_batch_size: per_batch(items as f64),
            avg_batch_latency_ms: per_batch(micros as f64 / 1000.0),
            current_batch_size: size,
            current_wait_us: wait.as_micros() as u64,
        }
    }

    /// Fail queued submissions with `Shutdown` and wait for in-flight batches.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "batch dispatcher ended abnormally");
            }
        }
        info!("command batcher shut down");
    }
}

impl std::fmt::Debug for CommandBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBatcher")
            .field("window", &self.current_window())
            .finish()
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<BatchItem>,
    cancel: CancellationToken,
) {
    let mut inflight = JoinSet::new();
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = done {
                    debug!(error = %e, "batch task failed");
                }
                continue;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let window = *shared.window.lock();
        let mut batch = vec![first];
        let deadline = Instant::now() + window.wait;
        while batch.len() < window.size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                fail_all(batch, MuxError::Shutdown);
                break;
            }
            permit = shared.batch_slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    fail_all(batch, MuxError::Shutdown);
                    break;
                }
            },
        };
        inflight.spawn(run_batch(shared.clone(), batch, permit));
    }

    rx.close();
    let mut pending = Vec::new();
    while let Ok(item) = rx.try_recv() {
        pending.push(item);
    }
    fail_all(pending, MuxError::Shutdown);
    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done {
            debug!(error = %e, "batch task failed");
        }
    }
}

fn fail_all(items: Vec<BatchItem>, err: MuxError) {
    for item in items {
        let _ = item.reply.send(Err(err.clone()));
    }
}

async fn run_batch(shared: Arc<Shared>, batch: Vec<BatchItem>, permit: OwnedSemaphorePermit) {
    let started = Instant::now();
    let commands: Vec<Vec<String>> = batch
        .iter()
        .flat_map(|item| item.commands.iter().cloned())
        .collect();

    let result = async {
        let mut conn = shared.pool.acquire().await?;
        let replies = conn.execute_many(&commands, shared.command_timeout).await;
        shared.pool.release(conn, replies.is_ok()).await;
        replies
    }
    .await;
    drop(permit);

    let size = batch.len();
    let completed = Instant::now();
    let latency_total: Duration = batch
        .iter()
        .map(|item| completed.duration_since(item.enqueued))
        .sum();
    let avg_command_latency = latency_total / size.max(1) as u32;

    match result {
        Ok(replies) if replies.len() == commands.len() => {
            let mut replies = replies.into_iter();
            for item in batch {
                let own: Vec<ControlReply> = replies.by_ref().take(item.commands.len()).collect();
                let _ = item.reply.send(combine(own));
            }
        }
        Ok(replies) => {
            shared
                .counters
                .failed_batches
                .fetch_add(1, Ordering::Relaxed);
            fail_all(
                batch,
                MuxError::Connection(format!(
                    "expected {} replies, received {}",
                    commands.len(),
                    replies.len()
                )),
            );
        }
        Err(e) => {
            shared
                .counters
                .failed_batches
                .fetch_add(1, Ordering::Relaxed);
            fail_all(batch, e);
        }
    }

    let elapsed = started.elapsed();
    let counters = &shared.counters;
    counters.batches.fetch_add(1, Ordering::Relaxed);
    counters.items.fetch_add(size as u64, Ordering::Relaxed);
    counters
        .commands
        .fetch_add(commands.len() as u64, Ordering::Relaxed);
    counters
        .batch_micros
        .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    debug!(
        size,
        commands = commands.len(),
        elapsed_us = elapsed.as_micros() as u64,
        "batch completed"
    );
    emit(
        &shared,
        BatcherEvent::BatchCompleted {
            size,
            commands: commands.len(),
            elapsed,
            avg_command_latency,
        },
    );
    if shared.config.adaptive {
        adapt(&shared, avg_command_latency);
    }
}

fn combine(replies: Vec<ControlReply>) -> Result<String, MuxError> {
    let mut out = String::new();
    for reply in replies {
        let text = reply.into_result()?;
        if !text.is_empty() {
            out.push_str(&text);
            out.push('\n');
        }
    }
    Ok(out)
}

fn emit(shared: &Shared, event: BatcherEvent) {
    if let Some(events) = &shared.events {
        let _ = events.send(event);
    }
}

fn adapt(shared: &Shared, observed: Duration) {
    let threshold = Duration::from_millis(shared.config.performance_threshold_ms);
    let max_size = shared.config.max_batch_size.max(1);
    let max_wait = Duration::from_millis(shared.config.max_batch_wait_ms);
    let adjusted = {
        let mut window = shared.window.lock();
        let before = *window;
        if observed > threshold {
            window.wait /= 2;
            window.size = (window.size * 3 / 4).max(1);
        } else if observed < threshold / 2 {
            let step = (window.wait / 4).max(MIN_WAIT_STEP);
            window.wait = (window.wait + step).min(max_wait);
            window.size = (window.size + 1).min(max_size);
        }
        (before.size != window.size || before.wait != window.wait).then_some(*window)
    };
    if let Some(window) = adjusted {
        debug!(
            batch_size = window.size,
            wait_us = window.wait.as_micros() as u64,
            observed_us = observed.as_micros() as u64,
            "batch window adjusted"
        );
        emit(
            shared,
            BatcherEvent::WindowAdjusted {
                batch_size: window.size,
                wait: window.wait,
            },
        );
    }
}

//! Externally consumed entry point.
//!
//! [`TerminalControl`] owns a [`BackendManager`] and a FIFO command queue.
//! Commands and batches go through the queue, so commands submitted here
//! run in submission order; session lifecycle and capture calls go straight
//! to the backends.

mod queue;

pub use queue::QueueStats;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{AggregateMetrics, BackendManager, BackendStatus, TmuxBackend};
use crate::config::{Config, IntegrationConfig, DEFAULT_BACKEND_NAME};
use crate::error::MuxError;
use crate::session::{CaptureChunk, CommandExecution, Session};

use queue::{Job, QueueShared};

/// A queued command or batch; await [`PendingCommand::wait`] for the result.
pub struct PendingCommand {
    reply: oneshot::Receiver<Result<Vec<CommandExecution>, MuxError>>,
}

impl PendingCommand {
    pub async fn wait(self) -> Result<CommandExecution, MuxError> {
        self.wait_all()
            .await?
            .pop()
            .ok_or_else(|| MuxError::Execution("queue returned no execution".to_string()))
    }

    pub async fn wait_all(self) -> Result<Vec<CommandExecution>, MuxError> {
        self.reply.await.map_err(|_| MuxError::Shutdown)?
    }
}

pub struct TerminalControl {
    backends: Arc<BackendManager>,
    shared: Arc<QueueShared>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalControl {
    /// Start the queue worker over already initialized backends.
    pub fn new(config: IntegrationConfig, backends: Arc<BackendManager>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(QueueShared::default());
        let worker = queue::spawn_worker(backends.clone(), config, shared.clone(), rx);
        Self {
            backends,
            shared,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The tmux backend for `config`, registered, initialized and health
    /// checked in the background.
    pub async fn from_config(config: &Config) -> Result<Self, MuxError> {
        let tmux = TmuxBackend::from_config(DEFAULT_BACKEND_NAME, config).await?;
        let audit = tmux.manager().audit().clone();
        let backends = Arc::new(BackendManager::new(config.backend.clone(), audit));
        backends.register(Arc::new(tmux))?;
        backends.initialize().await?;
        backends.start_health_checks();
        info!(mode = %config.tmux.mode, strategy = %config.backend.strategy, "terminal control ready");
        Ok(Self::new(config.integration.clone(), backends))
    }

    pub fn backends(&self) -> &Arc<BackendManager> {
        &self.backends
    }

    async fn enqueue(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        commands: Vec<String>,
    ) -> Result<PendingCommand, MuxError> {
        let sender = self.sender.lock().clone().ok_or(MuxError::Shutdown)?;
        let (reply, rx) = oneshot::channel();
        let job = Job {
            session_id: session_id.to_string(),
            pane_id: pane_id.map(str::to_string),
            commands,
            reply,
        };
        self.shared.enqueued();
        if sender.send(job).await.is_err() {
            return Err(MuxError::Shutdown);
        }
        Ok(PendingCommand { reply: rx })
    }

    /// Queue one command and return without waiting for it to run.
    pub async fn submit(
        &self,
        session_id: &str,
        command: &str,
        pane_id: Option<&str>,
    ) -> Result<PendingCommand, MuxError> {
        self.enqueue(session_id, pane_id, vec![command.to_string()])
            .await
    }

    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        pane_id: Option<&str>,
    ) -> Result<CommandExecution, MuxError> {
        self.submit(session_id, command, pane_id).await?.wait().await
    }

    /// Run `commands` in order as one queue entry, stopping at the first
    /// failure. Commands that completed before it stay in [`history`].
    ///
    /// [`history`]: TerminalControl::history
    pub async fn execute_batch(
        &self,
        session_id: &str,
        commands: &[String],
    ) -> Result<Vec<CommandExecution>, MuxError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.enqueue(session_id, None, commands.to_vec())
            .await?
            .wait_all()
            .await
    }

    pub async fn create_session(&self, name: &str) -> Result<Session, MuxError> {
        self.backends.create_session(name).await
    }

    pub async fn destroy_session(&self, id: &str) -> Result<(), MuxError> {
        self.backends.destroy_session(id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, MuxError> {
        self.backends.list_sessions().await
    }

    pub async fn capture_output(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        lines: usize,
    ) -> Result<String, MuxError> {
        self.backends.capture_output(session_id, pane_id, lines).await
    }

    pub async fn start_continuous_capture(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        sink: mpsc::UnboundedSender<CaptureChunk>,
    ) -> Result<String, MuxError> {
        self.backends
            .start_continuous_capture(session_id, pane_id, sink)
            .await
    }

    pub async fn stop_continuous_capture(&self, capture_id: &str) -> bool {
        self.backends.stop_continuous_capture(capture_id).await
    }

    /// Commands that went through the queue, oldest first. Failures are
    /// kept with their error set.
    pub fn history(&self) -> Vec<CommandExecution> {
        self.shared.history()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.stats()
    }

    pub fn health(&self) -> Vec<BackendStatus> {
        self.backends.status()
    }

    pub fn metrics(&self) -> AggregateMetrics {
        self.backends.aggregate_metrics()
    }

    /// Finish queued work, then shut the backends down.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                debug!(error = %e, "queue worker ended abnormally");
            }
        }
        self.backends.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::AuditLogger;
    use crate::session::{ManagerDeps, SessionManager};
    use crate::testsupport::FakeMux;
    use std::time::Duration;

    async fn control(fake: &FakeMux, integration: IntegrationConfig) -> TerminalControl {
        let config = FakeMux::test_config();
        let audit = Arc::new(AuditLogger::new(100));
        let deps = ManagerDeps::new(Arc::new(fake.clone()), Arc::new(fake.clone()), audit.clone());
        let manager = SessionManager::new(&config, deps).unwrap();
        let backends = Arc::new(BackendManager::new(config.backend.clone(), audit));
        backends
            .register(Arc::new(TmuxBackend::new(DEFAULT_BACKEND_NAME, Arc::new(manager), 8)))
            .unwrap();
        backends.initialize().await.unwrap();
        TerminalControl::new(integration, backends)
    }

    #[tokio::test]
    async fn queued_commands_run_in_submission_order() {
        let fake = FakeMux::new();
        let control = control(&fake, IntegrationConfig::default()).await;
        let session = control.create_session("s1").await.unwrap();

        let mut pending = Vec::new();
        for n in 1..=5 {
            pending.push(control.submit(&session.id, &format!("echo {n}"), None).await.unwrap());
        }
        for ticket in pending {
            ticket.wait().await.unwrap();
        }

        let output = control.capture_output(&session.id, None, 50).await.unwrap();
        let echoed: Vec<&str> = output.lines().filter(|l| l.len() == 1).collect();
        assert_eq!(echoed, vec!["1", "2", "3", "4", "5"]);
        let commands: Vec<String> = control.history().into_iter().map(|e| e.command).collect();
        assert_eq!(commands, vec!["echo 1", "echo 2", "echo 3", "echo 4", "echo 5"]);
        assert_eq!(control.queue_stats().processed, 5);
        assert_eq!(control.queue_stats().pending, 0);
        control.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_is_throttled() {
        let fake = FakeMux::new();
        let control = control(&fake, IntegrationConfig::default()).await;
        let session = control.create_session("s1").await.unwrap();

        control.execute_command(&session.id, "echo fast", None).await.unwrap();
        assert_eq!(control.queue_stats().throttled, 0);

        fake.set_delay(Duration::from_millis(40));
        for _ in 0..3 {
            control.execute_command(&session.id, "echo slow", None).await.unwrap();
        }
        let stats = control.queue_stats();
        assert!(stats.throttled >= 2, "{stats:?}");
        assert!(stats.recent_avg_latency_ms >= 10.0);
    }

    #[tokio::test]
    async fn batch_stops_at_first_failure_and_history_is_bounded() {
        let fake = FakeMux::new();
        let integration = IntegrationConfig {
            history_limit: 3,
            ..IntegrationConfig::default()
        };
        let control = control(&fake, integration).await;
        let session = control.create_session("s1").await.unwrap();

        let batch: Vec<String> = ["echo a", "echo b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(control.execute_batch(&session.id, &batch).await.unwrap().len(), 2);

        let bad: Vec<String> = ["echo c", "echo d && reboot", "echo e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = control.execute_batch(&session.id, &bad).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Security);

        let history: Vec<(String, bool)> = control
            .history()
            .into_iter()
            .map(|e| (e.command, e.error.is_some()))
            .collect();
        assert_eq!(
            history,
            vec![
                ("echo b".to_string(), false),
                ("echo c".to_string(), false),
                ("echo d && reboot".to_string(), true),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_batch_keeps_completed_commands_and_sends_each_once() {
        let fake = FakeMux::new();
        let control = control(&fake, IntegrationConfig::default()).await;
        let session = control.create_session("s1").await.unwrap();
        fake.set_slow_arg("make slow", Duration::from_secs(120));
        let before = fake.call_count();

        let batch: Vec<String> = ["echo a", "echo b", "make slow", "echo c"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = control.execute_batch(&session.id, &batch).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);

        let history: Vec<(String, bool)> = control
            .history()
            .into_iter()
            .map(|e| (e.command, e.error.is_some()))
            .collect();
        assert_eq!(
            history,
            vec![
                ("echo a".to_string(), false),
                ("echo b".to_string(), false),
                ("make slow".to_string(), true),
            ]
        );
        // Two send-keys per completed command, one for the text that hung.
        let sends = fake.calls()[before..]
            .iter()
            .filter(|argv| argv.iter().any(|a| a == "send-keys"))
            .count();
        assert_eq!(sends, 5);
        control.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_submissions() {
        let fake = FakeMux::new();
        let control = control(&fake, IntegrationConfig::default()).await;
        let session = control.create_session("s1").await.unwrap();
        assert_eq!(control.list_sessions().await.unwrap().len(), 1);
        assert!(control.health()[0].health.healthy);

        control.shutdown().await;
        let err = control.execute_command(&session.id, "echo late", None).await.unwrap_err();
        assert_eq!(err, MuxError::Shutdown);
    }
}

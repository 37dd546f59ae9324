//! [`TerminalBackend`] over a tmux [`SessionManager`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::MuxError;
use crate::session::{
    CaptureChunk, CommandExecution, ManagerDeps, PerformanceMetrics, Session, SessionManager,
};
use crate::textutil::now_unix_millis;
use crate::tmux::is_no_server_error;

use super::{BackendCapabilities, BackendHealth, TerminalBackend};

pub struct TmuxBackend {
    name: String,
    manager: Arc<SessionManager>,
    max_concurrency: usize,
}

impl TmuxBackend {
    pub fn new(name: impl Into<String>, manager: Arc<SessionManager>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            manager,
            max_concurrency,
        }
    }

    /// Backend over the real tmux binary described by `config`.
    pub async fn from_config(name: impl Into<String>, config: &Config) -> Result<Self, MuxError> {
        let deps = ManagerDeps::from_config(config).await?;
        let manager = SessionManager::new(config, deps)?;
        Ok(Self::new(
            name,
            Arc::new(manager),
            config.security.max_concurrent_commands,
        ))
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            continuous_capture: true,
            session_recovery: true,
            batch_execution: true,
            max_concurrency: self.max_concurrency,
        }
    }

    async fn initialize(&self) -> Result<(), MuxError> {
        self.manager.initialize().await?;
        self.manager.start_background_tasks();
        Ok(())
    }

    async fn create_session(&self, name: &str) -> Result<Session, MuxError> {
        self.manager.create_session(name).await
    }

    async fn destroy_session(&self, id: &str) -> Result<(), MuxError> {
        self.manager.destroy_session(id).await
    }

    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        pane_id: Option<&str>,
    ) -> Result<CommandExecution, MuxError> {
        self.manager.send_command(session_id, command, pane_id).await
    }

    async fn capture_output(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        lines: usize,
    ) -> Result<String, MuxError> {
        self.manager.capture_output(session_id, pane_id, lines).await
    }

    async fn start_continuous_capture(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        sink: mpsc::UnboundedSender<CaptureChunk>,
    ) -> Result<String, MuxError> {
        self.manager
            .start_continuous_capture(session_id, pane_id, sink)
            .await
    }

    async fn stop_continuous_capture(&self, capture_id: &str) -> bool {
        self.manager.stop_continuous_capture(capture_id).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, MuxError> {
        self.manager.refresh_sessions().await
    }

    /// A `list-sessions` round trip. A server with no sessions is healthy.
    async fn perform_health_check(&self) -> BackendHealth {
        let mut details = BTreeMap::new();
        if self.manager.is_closed() {
            details.insert("error".to_string(), "shut down".to_string());
            return BackendHealth {
                healthy: false,
                checked_at_ms: now_unix_millis(),
                details,
                ..BackendHealth::default()
            };
        }
        let started = Instant::now();
        let result = self.manager.ping("backend-health").await;
        let latency = started.elapsed();
        let healthy = match result {
            Ok(out) => {
                details.insert("sessions".to_string(), out.stdout.lines().count().to_string());
                true
            }
            Err(MuxError::Execution(msg)) if is_no_server_error(&msg) => {
                details.insert("server".to_string(), "not running".to_string());
                true
            }
            Err(e) => {
                details.insert("error".to_string(), e.to_string());
                false
            }
        };
        details.insert("strategy".to_string(), format!("{:?}", self.manager.strategy()));
        if let Some(pool) = self.manager.pool_metrics() {
            details.insert("pool_open".to_string(), pool.open.to_string());
        }
        let metrics = self.manager.performance_metrics();
        BackendHealth {
            healthy,
            latency,
            error_rate: 1.0 - metrics.success_rate,
            checked_at_ms: now_unix_millis(),
            consecutive_failures: 0,
            details,
        }
    }

    fn performance_metrics(&self) -> PerformanceMetrics {
        self.manager.performance_metrics()
    }

    async fn release(&self) {
        self.manager.release().await;
    }

    async fn shutdown(&self) {
        self.manager.cleanup().await;
    }
}

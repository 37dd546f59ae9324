//! Terminal backend contract and the manager that selects among backends.
//!
//! A backend is anything that can run the session operations; the only one
//! shipped is [`TmuxBackend`], which wraps a [`SessionManager`]. The
//! [`BackendManager`] routes every call through a selection strategy, retries
//! retryable failures down the fallback chain and tracks health.
//!
//! [`SessionManager`]: crate::session::SessionManager

mod manager;
mod strategy;
mod tmux;

pub use manager::{AggregateMetrics, BackendManager, BackendStatus};
pub use strategy::{plan, Candidate};
pub use tmux::TmuxBackend;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::MuxError;
use crate::session::{CaptureChunk, CommandExecution, PerformanceMetrics, Session};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    pub continuous_capture: bool,
    pub session_recovery: bool,
    pub batch_execution: bool,
    pub max_concurrency: usize,
}

/// Result of one health probe, plus the manager's running failure count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    pub healthy: bool,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub error_rate: f64,
    /// Unix millis; zero until the first check.
    pub checked_at_ms: u64,
    pub consecutive_failures: u32,
    pub details: BTreeMap<String, String>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            latency: Duration::ZERO,
            error_rate: 0.0,
            checked_at_ms: 0,
            consecutive_failures: 0,
            details: BTreeMap::new(),
        }
    }
}

/// Executions of the commands that completed, in order, and the error that
/// stopped the rest.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub executions: Vec<CommandExecution>,
    pub error: Option<MuxError>,
}

impl BatchOutcome {
    pub fn failed(error: MuxError) -> Self {
        Self {
            executions: Vec::new(),
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Vec<CommandExecution>, MuxError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.executions),
        }
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(value.as_secs_f64() * 1000.0)
}

#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Registry key; must be unique within one manager.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    async fn initialize(&self) -> Result<(), MuxError>;

    async fn create_session(&self, name: &str) -> Result<Session, MuxError>;

    async fn destroy_session(&self, id: &str) -> Result<(), MuxError>;

    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        pane_id: Option<&str>,
    ) -> Result<CommandExecution, MuxError>;

    /// Run `commands` in order, stopping at the first failure.
    async fn execute_batch(&self, session_id: &str, commands: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for command in commands {
            match self.execute_command(session_id, command, None).await {
                Ok(execution) => outcome.executions.push(execution),
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    async fn capture_output(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        lines: usize,
    ) -> Result<String, MuxError>;

    async fn start_continuous_capture(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        sink: mpsc::UnboundedSender<CaptureChunk>,
    ) -> Result<String, MuxError>;

    async fn stop_continuous_capture(&self, capture_id: &str) -> bool;

    async fn list_sessions(&self) -> Result<Vec<Session>, MuxError>;

    /// Probe once. `consecutive_failures` is maintained by the manager.
    async fn perform_health_check(&self) -> BackendHealth;

    fn performance_metrics(&self) -> PerformanceMetrics;

    /// Stop background work and drop connections, leaving sessions running
    /// for whichever backend serves them next.
    async fn release(&self);

    async fn shutdown(&self);
}

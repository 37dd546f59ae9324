//! Session/window/pane model plus the orchestrating [`SessionManager`].

mod capture;
mod manager;
mod metrics;
mod registry;

pub use capture::CaptureHandle;
pub use manager::{ExecutionStrategy, ManagerDeps, SessionManager};
pub use metrics::{LatencyStats, PerformanceMetrics, PerformanceTracker};

use serde::Serialize;
use std::time::Duration;

/// A multiplexer session as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Unique for the lifetime of the process; also the tmux session name.
    pub id: String,
    /// Human label supplied at creation (or the tmux name when discovered).
    pub name: String,
    /// tmux's own `$n` identifier.
    pub tmux_id: String,
    pub pid: Option<u32>,
    /// Unix seconds.
    pub created_at: u64,
    pub attached: bool,
    /// Ordered by window index.
    pub windows: Vec<Window>,
}

impl Session {
    /// Active pane of the active window, falling back to the first pane.
    pub fn active_pane(&self) -> Option<&Pane> {
        let window = self
            .windows
            .iter()
            .find(|w| w.active)
            .or_else(|| self.windows.first())?;
        window
            .panes
            .iter()
            .find(|p| p.active)
            .or_else(|| window.panes.first())
    }

    pub fn find_pane(&self, pane_id: &str) -> Option<(&Window, &Pane)> {
        self.windows
            .iter()
            .find_map(|w| w.panes.iter().find(|p| p.id == pane_id).map(|p| (w, p)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Window {
    pub id: String,
    pub index: u32,
    pub name: String,
    pub active: bool,
    pub panes: Vec<Pane>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pane {
    pub id: String,
    pub index: u32,
    pub active: bool,
    pub width: u16,
    pub height: u16,
    pub command: String,
    pub pid: Option<u32>,
}

/// One `send_command` call as recorded in the bounded history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandExecution {
    pub session_id: String,
    pub window_id: Option<String>,
    pub pane_id: Option<String>,
    pub command: String,
    pub submitted_at_ms: u64,
    #[serde(serialize_with = "serialize_millis")]
    pub execution_time: Duration,
    pub output: Option<String>,
    pub error: Option<String>,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(value.as_secs_f64() * 1000.0)
}

/// Output delivered by a continuous capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureChunk {
    pub capture_id: String,
    pub session_id: String,
    pub pane_id: String,
    pub data: String,
}

/// Notifications published by the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Created(Session),
    Destroyed { session_id: String },
    CommandExecuted(CommandExecution),
    OutputCaptured {
        session_id: String,
        pane_id: Option<String>,
        lines: usize,
    },
    Refreshed { sessions: usize, from_cache: bool },
    CaptureStopped { capture_id: String, session_id: String },
}

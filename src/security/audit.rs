//! Append-only, hash-chained security audit trail.
//!
//! Events are retained in memory (bounded), mirrored to `tracing` under the
//! `muxctl::audit` target, and optionally appended as JSON lines to a file by
//! a background writer task. Each event's `hash` covers the previous event's
//! hash plus its own canonical JSON, so retained history can be verified.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::MuxError;
use crate::textutil::now_unix_millis;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CommandExecuted,
    CommandFailed,
    ValidationFailed,
    SecurityViolation,
    RateLimitExceeded,
    ConcurrencyLimited,
    ProcessSpawned,
    SessionCreated,
    SessionDestroyed,
    OperationFailed,
    BackendHealthChanged,
    ComponentShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Blocked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user: Option<String>,
}

impl AuditEventType {
    fn defaults(self) -> (Severity, Outcome, u8) {
        match self {
            Self::CommandExecuted => (Severity::Info, Outcome::Success, 1),
            Self::ProcessSpawned => (Severity::Low, Outcome::Success, 2),
            Self::SessionCreated | Self::SessionDestroyed => (Severity::Info, Outcome::Success, 1),
            Self::ComponentShutdown => (Severity::Info, Outcome::Success, 0),
            Self::BackendHealthChanged => (Severity::Medium, Outcome::Failure, 3),
            Self::CommandFailed | Self::OperationFailed => (Severity::Medium, Outcome::Failure, 5),
            Self::ValidationFailed => (Severity::Medium, Outcome::Blocked, 4),
            Self::ConcurrencyLimited => (Severity::Medium, Outcome::Blocked, 5),
            Self::RateLimitExceeded => (Severity::High, Outcome::Blocked, 7),
            Self::SecurityViolation => (Severity::Critical, Outcome::Blocked, 9),
        }
    }
}

/// An event as submitted, before sequencing and hashing.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub component: String,
    pub description: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub client: Option<ClientInfo>,
    pub outcome: Outcome,
    pub risk_score: u8,
}

impl AuditEntry {
    /// Entry with severity, outcome and risk defaulted from the event type.
    pub fn new(
        event_type: AuditEventType,
        component: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let (severity, outcome, risk_score) = event_type.defaults();
        Self {
            event_type,
            severity,
            component: component.into(),
            description: description.into(),
            metadata: BTreeMap::new(),
            client: None,
            outcome,
            risk_score,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Risk is clamped to 0..=10.
    pub fn risk(mut self, score: u8) -> Self {
        self.risk_score = score.min(10);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn client(mut self, client: Option<ClientInfo>) -> Self {
        self.client = client;
        self
    }
}

/// An immutable, sequenced audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub component: String,
    pub description: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub client: Option<ClientInfo>,
    pub outcome: Outcome,
    pub risk_score: u8,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct CanonicalEvent<'a> {
    seq: u64,
    timestamp_ms: u64,
    event_type: AuditEventType,
    severity: Severity,
    component: &'a str,
    description: &'a str,
    metadata: &'a BTreeMap<String, serde_json::Value>,
    client: &'a Option<ClientInfo>,
    outcome: Outcome,
    risk_score: u8,
}

impl AuditEvent {
    fn compute_hash(&self) -> String {
        let canonical = CanonicalEvent {
            seq: self.seq,
            timestamp_ms: self.timestamp_ms,
            event_type: self.event_type,
            severity: self.severity,
            component: &self.component,
            description: &self.description,
            metadata: &self.metadata,
            client: &self.client,
            outcome: self.outcome,
            risk_score: self.risk_score,
        };
        let body = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(body.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub min_severity: Option<Severity>,
    pub min_risk: Option<u8>,
    pub component: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type.map_or(true, |t| t == event.event_type)
            && self.min_severity.map_or(true, |s| event.severity >= s)
            && self.min_risk.map_or(true, |r| event.risk_score >= r)
            && self
                .component
                .as_deref()
                .map_or(true, |c| c == event.component)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub total: u64,
    pub retained: usize,
    pub by_severity: BTreeMap<String, u64>,
    pub blocked: u64,
    pub failures: u64,
    pub high_risk: u64,
}

struct AuditState {
    events: VecDeque<AuditEvent>,
    next_seq: u64,
    last_hash: String,
    stats: AuditStats,
}

pub struct AuditLogger {
    max_events: usize,
    state: Mutex<AuditState>,
    sink: Mutex<Option<mpsc::UnboundedSender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Risk at or above this counts as high risk in [`AuditStats`].
pub const HIGH_RISK_THRESHOLD: u8 = 7;

impl AuditLogger {
    /// In-memory logger retaining at most `max_events`.
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            state: Mutex::new(AuditState {
                events: VecDeque::new(),
                next_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
                stats: AuditStats::default(),
            }),
            sink: Mutex::new(None),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Logger that also appends JSON lines to `path`.
    pub async fn with_file(max_events: usize, path: &Path) -> Result<Self, MuxError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MuxError::Execution(format!("audit log directory: {}", e.kind())))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| MuxError::Execution(format!("audit log open: {}", e.kind())))?;

        let logger = Self::new(max_events);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_lines(file, rx, path.to_path_buf()));
        *logger.sink.lock() = Some(tx);
        *logger.writer.lock() = Some(handle);
        Ok(logger)
    }

    /// Sequence, hash, retain and mirror one entry.
    pub fn log(&self, entry: AuditEntry) -> AuditEvent {
        let event = {
            let mut state = self.state.lock();
            let mut event = AuditEvent {
                seq: state.next_seq,
                timestamp_ms: now_unix_millis(),
                event_type: entry.event_type,
                severity: entry.severity,
                component: entry.component,
                description: entry.description,
                metadata: entry.metadata,
                client: entry.client,
                outcome: entry.outcome,
                risk_score: entry.risk_score.min(10),
                prev_hash: state.last_hash.clone(),
                hash: String::new(),
            };
            event.hash = event.compute_hash();
            state.next_seq += 1;
            state.last_hash = event.hash.clone();

            let stats = &mut state.stats;
            stats.total += 1;
            *stats
                .by_severity
                .entry(severity_label(event.severity).to_string())
                .or_default() += 1;
            match event.outcome {
                Outcome::Blocked => stats.blocked += 1,
                Outcome::Failure => stats.failures += 1,
                Outcome::Success => {}
            }
            if event.risk_score >= HIGH_RISK_THRESHOLD {
                stats.high_risk += 1;
            }

            state.events.push_back(event.clone());
            while state.events.len() > self.max_events {
                state.events.pop_front();
            }
            state.stats.retained = state.events.len();
            event
        };

        mirror_to_tracing(&event);
        if !self.closed.load(Ordering::Acquire) {
            if let Some(tx) = self.sink.lock().as_ref() {
                match serde_json::to_string(&event) {
                    Ok(line) => {
                        let _ = tx.send(line);
                    }
                    Err(e) => warn!(error = %e, "failed to serialize audit event"),
                }
            }
        }
        event
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Matching events, newest last; `limit` keeps the most recent.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let state = self.state.lock();
        let mut matched: Vec<AuditEvent> = state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn stats(&self) -> AuditStats {
        self.state.lock().stats.clone()
    }

    /// Recompute every retained hash and check the links between them.
    pub fn verify_chain(&self) -> bool {
        let state = self.state.lock();
        let mut expected_prev: Option<&str> = None;
        for event in &state.events {
            if let Some(prev) = expected_prev {
                if event.prev_hash != prev {
                    return false;
                }
            } else if event.seq == 0 && event.prev_hash != GENESIS_HASH {
                return false;
            }
            if event.compute_hash() != event.hash {
                return false;
            }
            expected_prev = Some(&event.hash);
        }
        true
    }

    /// Stop accepting file writes and flush the writer task.
    pub async fn shutdown(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.log(AuditEntry::new(
            AuditEventType::ComponentShutdown,
            "audit",
            "audit logger shut down",
        ));
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender ends the writer loop after it drains.
        drop(self.sink.lock().take());
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "audit writer task failed");
            }
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("max_events", &self.max_events)
            .field("retained", &self.state.lock().events.len())
            .finish()
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn mirror_to_tracing(event: &AuditEvent) {
    let kind = serde_json::to_value(event.event_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    match event.severity {
        Severity::Info => debug!(
            target: "muxctl::audit",
            seq = event.seq,
            kind = %kind,
            component = %event.component,
            risk = event.risk_score,
            "{}",
            event.description
        ),
        Severity::Low => info!(
            target: "muxctl::audit",
            seq = event.seq,
            kind = %kind,
            component = %event.component,
            risk = event.risk_score,
            "{}",
            event.description
        ),
        Severity::Medium | Severity::High => warn!(
            target: "muxctl::audit",
            seq = event.seq,
            kind = %kind,
            component = %event.component,
            risk = event.risk_score,
            "{}",
            event.description
        ),
        Severity::Critical => error!(
            target: "muxctl::audit",
            seq = event.seq,
            kind = %kind,
            component = %event.component,
            risk = event.risk_score,
            "{}",
            event.description
        ),
    }
}

async fn write_lines(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<String>,
    path: PathBuf,
) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(path = %path.display(), error = %e, "audit log write failed");
            return;
        }
    }
    if let Err(e) = file.flush().await {
        debug!(error = %e, "audit log flush failed");
    }
}

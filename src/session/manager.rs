//! Session orchestration over the secure executor and the performance layer.
//!
//! Every operation is rendered into a [`MuxOperation`] and delivered by one
//! [`ExecutionStrategy`]: `Direct` spawns the binary per invocation, `Batched`
//! hands the invocations to the command batcher over pooled control-mode
//! connections. Both go through the same executor admission and audit, so
//! callers observe identical results and errors in every performance mode.
//!
//! Local state (registry, history, cache) is only touched after the
//! multiplexer call succeeded.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ManagerConfig, PerformanceMode, TmuxConfig};
use crate::error::{ErrorKind, MuxError};
use crate::performance::{
    BatcherEvent, BatcherMetrics, CacheStats, CommandBatcher, ConnectionPool, PoolMetrics,
    SessionCache,
};
use crate::security::{
    AuditEntry, AuditEventType, AuditLogger, CommandOutput, ExecutorStats, RequestContext,
    SecureCommandExecutor,
};
use crate::textutil::{now_unix_millis, tail_lines};
use crate::tmux::{
    is_no_server_error, parse_tree, sanitize_name_fragment, session_pane_target,
    ControlConnector, MuxOperation, TmuxControlConnector,
};
use crate::transport::{MuxTransport, ProcessTransport};

use super::capture::{spawn_capture, CaptureHandle};
use super::metrics::{PerformanceMetrics, PerformanceTracker};
use super::registry::{build_sessions, SessionRegistry};
use super::{CaptureChunk, CommandExecution, Session, SessionEvent};

const COMPONENT: &str = "session-manager";
const CREATE_ATTEMPTS: usize = 3;

/// How rendered invocations reach the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// One spawned process per invocation.
    Direct,
    /// Batched over pooled control-mode connections.
    Batched,
}

impl ExecutionStrategy {
    pub fn for_mode(mode: PerformanceMode) -> Self {
        if mode.uses_batching() {
            Self::Batched
        } else {
            Self::Direct
        }
    }
}

/// Collaborators injected into a [`SessionManager`].
pub struct ManagerDeps {
    pub transport: Arc<dyn MuxTransport>,
    pub connector: Arc<dyn ControlConnector>,
    pub audit: Arc<AuditLogger>,
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
    pub batcher_events: Option<mpsc::UnboundedSender<BatcherEvent>>,
}

impl ManagerDeps {
    pub fn new(
        transport: Arc<dyn MuxTransport>,
        connector: Arc<dyn ControlConnector>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            transport,
            connector,
            audit,
            events: None,
            batcher_events: None,
        }
    }

    /// Real tmux process transport and control connector, plus the audit
    /// logger described by `config.security`.
    pub async fn from_config(config: &Config) -> Result<Self, MuxError> {
        let tmux = &config.tmux;
        let audit = match &config.security.audit_log_path {
            Some(path) => AuditLogger::with_file(config.security.audit_max_events, path).await?,
            None => AuditLogger::new(config.security.audit_max_events),
        };
        let connector = TmuxControlConnector::new(
            tmux.binary.clone(),
            tmux.socket_path.clone(),
            tmux.control_session.clone(),
            tmux.command_timeout(),
        );
        Ok(Self::new(
            Arc::new(ProcessTransport::new()),
            Arc::new(connector),
            Arc::new(audit),
        ))
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_batcher_events(mut self, events: mpsc::UnboundedSender<BatcherEvent>) -> Self {
        self.batcher_events = Some(events);
        self
    }
}

pub struct SessionManager {
    tmux: TmuxConfig,
    settings: ManagerConfig,
    strategy: ExecutionStrategy,
    executor: Arc<SecureCommandExecutor>,
    audit: Arc<AuditLogger>,
    pool: Option<ConnectionPool>,
    batcher: Option<CommandBatcher>,
    cache: Option<SessionCache>,
    registry: Mutex<SessionRegistry>,
    /// Bumped under the registry lock by every create and removal.
    generation: AtomicU64,
    history: Mutex<VecDeque<CommandExecution>>,
    tracker: Mutex<PerformanceTracker>,
    captures: Arc<Mutex<HashMap<String, CaptureHandle>>>,
    next_session: AtomicU64,
    next_capture: AtomicU64,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionManager {
    /// Wire the executor and, per `config.tmux.mode`, the pool, batcher and
    /// cache. Must be called inside a tokio runtime when batching is enabled.
    pub fn new(config: &Config, deps: ManagerDeps) -> Result<Self, MuxError> {
        let executor = Arc::new(SecureCommandExecutor::new(
            &config.tmux,
            &config.security,
            deps.transport,
            deps.audit.clone(),
        )?);
        let mode = config.tmux.mode;
        let strategy = ExecutionStrategy::for_mode(mode);
        let timeout = config.tmux.command_timeout();
        let (pool, batcher) = match strategy {
            ExecutionStrategy::Batched => {
                let pool = ConnectionPool::new(deps.connector, config.pool.clone(), timeout);
                let batcher = CommandBatcher::new(
                    pool.clone(),
                    config.batcher.clone(),
                    timeout,
                    deps.batcher_events,
                );
                (Some(pool), Some(batcher))
            }
            ExecutionStrategy::Direct => (None, None),
        };
        let cache = mode.uses_cache().then(|| SessionCache::new(&config.cache));
        let settings = config.manager.clone();
        Ok(Self {
            tmux: config.tmux.clone(),
            tracker: Mutex::new(PerformanceTracker::new(
                settings.max_latency_samples,
                Duration::from_millis(settings.latency_target_ms),
            )),
            settings,
            strategy,
            executor,
            audit: deps.audit,
            pool,
            batcher,
            cache,
            registry: Mutex::new(SessionRegistry::default()),
            generation: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
            captures: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(0),
            next_capture: AtomicU64::new(0),
            events: deps.events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the server, warm the pool and discover existing sessions.
    pub async fn initialize(&self) -> Result<(), MuxError> {
        let ctx = RequestContext::internal("session-init");
        self.run(&MuxOperation::StartServer, &ctx).await?;
        if let Some(pool) = &self.pool {
            pool.initialize().await?;
        }
        let sessions = self.refresh_sessions().await?;
        info!(
            mode = %self.tmux.mode,
            strategy = ?self.strategy,
            sessions = sessions.len(),
            "session manager initialized"
        );
        Ok(())
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn executor(&self) -> &Arc<SecureCommandExecutor> {
        &self.executor
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    fn ensure_open(&self) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            Err(MuxError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn user_context() -> RequestContext {
        RequestContext::new(COMPONENT)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn run(
        &self,
        op: &MuxOperation,
        ctx: &RequestContext,
    ) -> Result<CommandOutput, MuxError> {
        match (self.strategy, &self.batcher) {
            (ExecutionStrategy::Batched, Some(batcher)) => {
                self.executor
                    .execute_with(op, ctx, move |invocations| batcher.execute(invocations))
                    .await
            }
            _ => self.executor.execute(op, ctx).await,
        }
    }

    /// One `list-sessions` round trip over the configured strategy, outside
    /// the rate limit.
    pub async fn ping(&self, source: &str) -> Result<CommandOutput, MuxError> {
        self.run(&MuxOperation::ListSessions, &RequestContext::internal(source))
            .await
    }

    /// Count and audit a failed destroy/send/capture, then hand the error back.
    fn fail(&self, operation: &str, session_id: &str, err: MuxError) -> MuxError {
        self.tracker.lock().record_failure();
        let risk = match err.kind() {
            ErrorKind::Security => 8,
            ErrorKind::RateLimitExceeded => 6,
            ErrorKind::Timeout | ErrorKind::Connection => 5,
            ErrorKind::Validation => 4,
            ErrorKind::SessionNotFound => 3,
            _ => 5,
        };
        self.audit.log(
            AuditEntry::new(
                AuditEventType::OperationFailed,
                COMPONENT,
                format!("{operation} failed: {err}"),
            )
            .meta("operation", operation)
            .meta("session_id", session_id)
            .meta("error_kind", format!("{:?}", err.kind()))
            .risk(risk),
        );
        debug!(operation, session_id, error = %err, "session operation failed");
        err
    }

    fn forget(&self, id: &str) {
        let mut registry = self.registry.lock();
        if registry.remove(id).is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn tracked(&self, id: &str) -> Result<Session, MuxError> {
        self.registry
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| MuxError::SessionNotFound(id.to_string()))
    }

    fn next_session_id(&self, fragment: &str) -> String {
        loop {
            let n = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
            let candidate = format!("{fragment}-{n}");
            if candidate != self.tmux.control_session && !self.registry.lock().contains(&candidate)
            {
                return candidate;
            }
        }
    }

    async fn fetch_session(
        &self,
        id: &str,
        ctx: &RequestContext,
    ) -> Result<Option<Session>, MuxError> {
        let op = MuxOperation::ListPanes {
            session: Some(id.to_string()),
        };
        match self.run(&op, ctx).await {
            Ok(out) => Ok(build_sessions(parse_tree(&out.stdout), &self.tmux.control_session)
                .into_iter()
                .find(|s| s.id == id)),
            Err(MuxError::Execution(msg)) if is_gone(&msg) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a detached session labelled `name`. The returned id is unique
    /// for the life of the process.
    pub async fn create_session(&self, name: &str) -> Result<Session, MuxError> {
        self.ensure_open()?;
        let ctx = Self::user_context();
        self.executor.screen_text("name", name, &ctx)?;
        if name.chars().count() > 128 {
            return Err(MuxError::Validation("session name longer than 128 characters".into()));
        }
        let fragment = sanitize_name_fragment(name, "session");

        let mut attempt = 0;
        let (id, out) = loop {
            attempt += 1;
            let id = self.next_session_id(&fragment);
            let op = MuxOperation::NewSession {
                name: id.clone(),
                window_name: None,
                shell: self.tmux.default_shell.clone(),
                width: None,
                height: None,
            };
            match self.run(&op, &ctx).await {
                Ok(out) => break (id, out),
                Err(MuxError::Execution(msg))
                    if msg.contains("duplicate session") && attempt < CREATE_ATTEMPTS =>
                {
                    debug!(id = %id, "session name taken on the server, retrying");
                }
                Err(e) => return Err(self.fail("create-session", &id, e)),
            }
        };

        let created = build_sessions(parse_tree(&out.stdout), &self.tmux.control_session)
            .into_iter()
            .find(|s| s.id == id);
        let mut session = match created {
            Some(session) => session,
            None => self
                .fetch_session(&id, &RequestContext::internal(COMPONENT))
                .await
                .map_err(|e| self.fail("create-session", &id, e))?
                .ok_or_else(|| {
                    self.fail(
                        "create-session",
                        &id,
                        MuxError::Execution("created session is not listed".into()),
                    )
                })?,
        };
        if !name.trim().is_empty() {
            session.name = name.trim().to_string();
        }

        {
            let mut registry = self.registry.lock();
            registry.insert(session.clone());
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_list();
            cache.cache_session(&session);
        }
        self.audit.log(
            AuditEntry::new(
                AuditEventType::SessionCreated,
                COMPONENT,
                format!("created session {id}"),
            )
            .meta("session_id", id.as_str())
            .meta("source", ctx.source.as_str()),
        );
        info!(session = %id, "session created");
        self.emit(SessionEvent::Created(session.clone()));
        Ok(session)
    }

    /// Kill a tracked session and any capture attached to it. A session the
    /// server already lost counts as destroyed.
    pub async fn destroy_session(&self, id: &str) -> Result<(), MuxError> {
        self.ensure_open()?;
        self.destroy_with(id, &Self::user_context()).await
    }

    async fn destroy_with(&self, id: &str, ctx: &RequestContext) -> Result<(), MuxError> {
        if !self.registry.lock().contains(id) {
            return Err(self.fail(
                "destroy-session",
                id,
                MuxError::SessionNotFound(id.to_string()),
            ));
        }
        self.stop_captures_for(id).await;

        let op = MuxOperation::KillSession {
            name: id.to_string(),
        };
        match self.run(&op, ctx).await {
            Ok(_) => {}
            Err(MuxError::Execution(msg)) if is_gone(&msg) => {
                debug!(session = %id, "session already gone on the server");
            }
            Err(e) => return Err(self.fail("destroy-session", id, e)),
        }

        self.forget(id);
        if let Some(cache) = &self.cache {
            cache.invalidate_session(id);
        }
        self.audit.log(
            AuditEntry::new(
                AuditEventType::SessionDestroyed,
                COMPONENT,
                format!("destroyed session {id}"),
            )
            .meta("session_id", id)
            .meta("source", ctx.source.as_str()),
        );
        info!(session = %id, "session destroyed");
        self.emit(SessionEvent::Destroyed {
            session_id: id.to_string(),
        });
        Ok(())
    }

    /// Type `command` into a pane (the session's active pane by default) and
    /// press Enter.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: &str,
        pane_id: Option<&str>,
    ) -> Result<CommandExecution, MuxError> {
        self.ensure_open()?;
        let session = self
            .tracked(session_id)
            .map_err(|e| self.fail("send-command", session_id, e))?;
        let (target, window_id, pane_id) = resolve_target(&session, pane_id);
        let op = MuxOperation::SendKeys {
            target,
            text: Some(command.to_string()),
            keys: Vec::new(),
            press_enter: true,
        };

        let submitted_at_ms = now_unix_millis();
        let started = Instant::now();
        let result = self.run(&op, &Self::user_context()).await;
        let execution_time = started.elapsed();
        self.tracker
            .lock()
            .record_command(execution_time, result.is_ok());

        let execution = CommandExecution {
            session_id: session_id.to_string(),
            window_id,
            pane_id,
            command: command.to_string(),
            submitted_at_ms,
            execution_time,
            output: None,
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.push_history(execution.clone());

        if let Err(e) = result {
            return Err(self.fail("send-command", session_id, e));
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_session(session_id);
        }
        self.emit(SessionEvent::CommandExecuted(execution.clone()));
        Ok(execution)
    }

    fn push_history(&self, execution: CommandExecution) {
        let limit = self.settings.history_limit.max(1);
        let mut history = self.history.lock();
        if history.len() == limit {
            history.pop_front();
        }
        history.push_back(execution);
    }

    /// Most recent commands, oldest first.
    pub fn command_history(&self) -> Vec<CommandExecution> {
        self.history.lock().iter().cloned().collect()
    }

    /// The last `lines` lines of a pane, clamped to the capture buffer size.
    pub async fn capture_output(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        lines: usize,
    ) -> Result<String, MuxError> {
        self.ensure_open()?;
        let session = self
            .tracked(session_id)
            .map_err(|e| self.fail("capture-output", session_id, e))?;
        let (target, _, pane) = resolve_target(&session, pane_id);
        let lines = lines.clamp(1, self.tmux.capture_buffer_lines.max(1));
        let op = MuxOperation::CapturePane {
            target,
            start: Some(-(lines as i64)),
            end: None,
        };

        let started = Instant::now();
        let out = self
            .run(&op, &Self::user_context())
            .await
            .map_err(|e| self.fail("capture-output", session_id, e))?;
        self.tracker.lock().record_capture(started.elapsed());

        let text = tail_lines(out.stdout.trim_end_matches('\n'), lines);
        self.emit(SessionEvent::OutputCaptured {
            session_id: session_id.to_string(),
            pane_id: pane,
            lines: text.lines().count(),
        });
        Ok(text)
    }

    /// Stream a pane's output into `sink` until stopped. Returns the capture id.
    pub async fn start_continuous_capture(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        sink: mpsc::UnboundedSender<CaptureChunk>,
    ) -> Result<String, MuxError> {
        self.ensure_open()?;
        let session = self
            .tracked(session_id)
            .map_err(|e| self.fail("start-capture", session_id, e))?;
        let pane = match pane_id {
            Some(pane) => pane.to_string(),
            None => session
                .active_pane()
                .map(|p| p.id.clone())
                .ok_or_else(|| {
                    self.fail(
                        "start-capture",
                        session_id,
                        MuxError::Validation(format!("session {session_id} has no panes")),
                    )
                })?,
        };
        self.executor
            .validator()
            .validate_target(&pane)
            .map_err(|e| self.fail("start-capture", session_id, e))?;

        let op = MuxOperation::AttachSession {
            session: session_id.to_string(),
        };
        let stream = self
            .executor
            .spawn_secure_process(&op, &Self::user_context())
            .map_err(|e| self.fail("start-capture", session_id, e))?;
        let n = self.next_capture.fetch_add(1, Ordering::Relaxed) + 1;
        let capture_id = format!("capture-{n}");
        let on_exit = {
            let captures = Arc::downgrade(&self.captures);
            let events = self.events.clone();
            let capture_id = capture_id.clone();
            move || forget_capture(&captures, events.as_ref(), capture_id)
        };
        // Held across the spawn so a stream that ends at once finds its entry.
        let mut captures = self.captures.lock();
        let handle = spawn_capture(
            stream,
            capture_id.clone(),
            session_id.to_string(),
            pane.clone(),
            sink,
            on_exit,
        );
        captures.insert(capture_id.clone(), handle);
        drop(captures);
        info!(capture = %capture_id, session = %session_id, pane = %pane, "continuous capture started");
        Ok(capture_id)
    }

    /// Stop one capture. Returns whether it was running.
    pub async fn stop_continuous_capture(&self, capture_id: &str) -> bool {
        let handle = self.captures.lock().remove(capture_id);
        match handle {
            Some(handle) => {
                let session_id = handle.session_id.clone();
                handle.stop().await;
                self.emit(SessionEvent::CaptureStopped {
                    capture_id: capture_id.to_string(),
                    session_id,
                });
                true
            }
            None => false,
        }
    }

    pub fn active_captures(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.captures.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn stop_captures_for(&self, session_id: &str) {
        let ids: Vec<String> = self
            .captures
            .lock()
            .values()
            .filter(|h| h.session_id == session_id)
            .map(|h| h.id.clone())
            .collect();
        for id in ids {
            self.stop_continuous_capture(&id).await;
        }
    }

    /// Re-discover sessions, from the cache when it holds a fresh listing.
    /// A server that is not running yields an empty listing.
    pub async fn refresh_sessions(&self) -> Result<Vec<Session>, MuxError> {
        self.ensure_open()?;
        if let Some(list) = self.cache.as_ref().and_then(SessionCache::get_session_list) {
            self.registry.lock().replace_all(list.clone());
            self.emit(SessionEvent::Refreshed {
                sessions: list.len(),
                from_cache: true,
            });
            return Ok(list);
        }

        let ctx = RequestContext::internal("session-refresh");
        let op = MuxOperation::ListPanes { session: None };
        let started = self.generation.load(Ordering::Acquire);
        let discovered = match self.run(&op, &ctx).await {
            Ok(out) => build_sessions(parse_tree(&out.stdout), &self.tmux.control_session),
            Err(MuxError::Execution(msg)) if is_no_server_error(&msg) => Vec::new(),
            Err(e) => return Err(e),
        };
        // A create or destroy that landed during the round trip is newer than
        // the listing; keep the registry and leave the cached list empty.
        let (sessions, applied) = {
            let mut registry = self.registry.lock();
            if self.generation.load(Ordering::Acquire) == started {
                registry.replace_all(discovered);
                let sessions = registry.list();
                if let Some(cache) = &self.cache {
                    cache.cache_session_list(&sessions);
                }
                (sessions, true)
            } else {
                (registry.list(), false)
            }
        };
        if !applied {
            debug!("registry changed during refresh, listing discarded");
        }
        debug!(sessions = sessions.len(), "sessions refreshed");
        self.emit(SessionEvent::Refreshed {
            sessions: sessions.len(),
            from_cache: false,
        });
        Ok(sessions)
    }

    /// Tracked sessions ordered by creation time.
    pub fn get_sessions(&self) -> Vec<Session> {
        self.registry.lock().list()
    }

    /// A tracked session. With the cache enabled a fresh entry is served
    /// without a multiplexer call; a stale one is re-read from the server.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, MuxError> {
        self.ensure_open()?;
        let tracked = self.registry.lock().get(id).cloned();
        let Some(tracked) = tracked else {
            return Ok(None);
        };
        let Some(cache) = &self.cache else {
            return Ok(Some(tracked));
        };
        if let Some(session) = cache.get_session(id) {
            return Ok(Some(session));
        }
        let ctx = RequestContext::internal("session-lookup");
        match self.fetch_session(id, &ctx).await? {
            Some(mut session) => {
                session.name = tracked.name;
                self.registry.lock().insert(session.clone());
                cache.cache_session(&session);
                Ok(Some(session))
            }
            None => {
                self.forget(id);
                cache.invalidate_session(id);
                Ok(None)
            }
        }
    }

    pub fn active_session(&self) -> Option<Session> {
        self.registry.lock().active().cloned()
    }

    pub fn set_active_session(&self, id: &str) -> Result<(), MuxError> {
        if self.registry.lock().set_active(id) {
            Ok(())
        } else {
            Err(MuxError::SessionNotFound(id.to_string()))
        }
    }

    /// The snapshot computed by the last metrics tick.
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.tracker.lock().snapshot()
    }

    /// Recompute the metrics snapshot now.
    pub fn recompute_metrics(&self) -> PerformanceMetrics {
        self.tracker.lock().recompute()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(SessionCache::stats)
    }

    pub fn pool_metrics(&self) -> Option<PoolMetrics> {
        self.pool.as_ref().map(ConnectionPool::metrics)
    }

    pub fn batcher_metrics(&self) -> Option<BatcherMetrics> {
        self.batcher.as_ref().map(CommandBatcher::metrics)
    }

    /// Spawn the refresh and metrics timers and the cache sweeper. Calling
    /// it again is a no-op.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let refresh = Duration::from_millis(self.settings.refresh_interval_ms.max(1));
        let metrics = Duration::from_millis(self.settings.metrics_interval_ms.max(1));
        tasks.push(tokio::spawn(refresh_loop(
            Arc::downgrade(self),
            self.cancel.clone(),
            refresh,
        )));
        tasks.push(tokio::spawn(metrics_loop(
            Arc::downgrade(self),
            self.cancel.clone(),
            metrics,
        )));
        if let Some(cache) = &self.cache {
            cache.start_sweeper();
        }
    }

    /// Kill captures, destroy every tracked session (unless
    /// `destroy_sessions_on_cleanup` is off), then shut down batcher, pool,
    /// cache, executor and audit logger in that order.
    pub async fn cleanup(&self) {
        self.close(self.settings.destroy_sessions_on_cleanup, true)
            .await;
    }

    /// Like [`cleanup`](Self::cleanup) but every session keeps running and
    /// the audit logger, which the caller may share, stays open.
    pub async fn release(&self) {
        self.close(false, false).await;
    }

    async fn close(&self, destroy_sessions: bool, close_audit: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }

        let captures: Vec<CaptureHandle> = self.captures.lock().drain().map(|(_, h)| h).collect();
        for handle in captures {
            handle.stop().await;
        }

        let ctx = RequestContext::internal("session-cleanup");
        let ids: Vec<String> = if destroy_sessions {
            self.registry.lock().list().into_iter().map(|s| s.id).collect()
        } else {
            Vec::new()
        };
        for id in ids {
            if let Err(e) = self.destroy_with(&id, &ctx).await {
                warn!(session = %id, error = %e, "failed to destroy session during cleanup");
            }
        }

        if let Some(batcher) = &self.batcher {
            batcher.shutdown().await;
        }
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        if let Some(cache) = &self.cache {
            cache.shutdown().await;
        }
        self.executor.shutdown();
        if close_audit {
            self.audit.shutdown().await;
        }
        info!(destroy_sessions, "session manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("strategy", &self.strategy)
            .field("sessions", &self.registry.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Target plus the window and pane ids recorded in history.
fn resolve_target(
    session: &Session,
    pane_id: Option<&str>,
) -> (String, Option<String>, Option<String>) {
    match pane_id {
        Some(pane) => {
            let window = session.find_pane(pane).map(|(w, _)| w.id.clone());
            (pane.to_string(), window, Some(pane.to_string()))
        }
        None => {
            let window = session
                .windows
                .iter()
                .find(|w| w.active)
                .or_else(|| session.windows.first())
                .map(|w| w.id.clone());
            let pane = session.active_pane().map(|p| p.id.clone());
            (session_pane_target(&session.id), window, pane)
        }
    }
}

fn is_gone(message: &str) -> bool {
    message.contains("can't find session") || is_no_server_error(message)
}

/// Drop a capture whose reader stopped by itself. Explicit stops have already
/// removed the entry and announced it.
fn forget_capture(
    captures: &Weak<Mutex<HashMap<String, CaptureHandle>>>,
    events: Option<&mpsc::UnboundedSender<SessionEvent>>,
    capture_id: String,
) {
    let Some(captures) = captures.upgrade() else {
        return;
    };
    let ended = captures.lock().remove(&capture_id);
    let Some(handle) = ended else {
        return;
    };
    debug!(capture = %capture_id, session = %handle.session_id, "capture stream ended");
    if let Some(events) = events {
        let _ = events.send(SessionEvent::CaptureStopped {
            capture_id,
            session_id: handle.session_id.clone(),
        });
    }
}

async fn refresh_loop(manager: Weak<SessionManager>, cancel: CancellationToken, every: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if let Err(e) = manager.refresh_sessions().await {
            debug!(error = %e, "background refresh failed");
        }
    }
}

async fn metrics_loop(manager: Weak<SessionManager>, cancel: CancellationToken, every: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.recompute_metrics();
    }
}

//! Backend registry with strategy routing, failover, health and hot swap.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::MuxError;
use crate::security::{AuditEntry, AuditEventType, AuditLogger, Outcome, Severity};
use crate::session::{CaptureChunk, CommandExecution, PerformanceMetrics, Session};

use super::strategy::{plan, Candidate};
use super::{BackendCapabilities, BackendHealth, BatchOutcome, TerminalBackend};

const COMPONENT: &str = "backend-manager";
const DRAIN_POLL: Duration = Duration::from_millis(10);

struct Entry {
    name: String,
    backend: Arc<dyn TerminalBackend>,
    health: BackendHealth,
    draining: bool,
    in_flight: Arc<AtomicUsize>,
    operations: u64,
    failures: u64,
    latency_micros: u64,
}

impl Entry {
    fn new(backend: Arc<dyn TerminalBackend>) -> Self {
        Self {
            name: backend.name().to_string(),
            backend,
            health: BackendHealth::default(),
            draining: false,
            in_flight: Arc::new(AtomicUsize::new(0)),
            operations: 0,
            failures: 0,
            latency_micros: 0,
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        let succeeded = self.operations - self.failures;
        if succeeded == 0 {
            self.health.latency.as_secs_f64() * 1000.0
        } else {
            self.latency_micros as f64 / succeeded as f64 / 1000.0
        }
    }
}

#[derive(Default)]
struct State {
    /// Fallback chain order; names not in `chain` follow in registration order.
    entries: Vec<Entry>,
    chain: Vec<String>,
    affinity: HashMap<String, String>,
    captures: HashMap<String, String>,
    round_robin: usize,
}

impl State {
    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn insert(&mut self, entry: Entry) {
        self.entries.push(entry);
        let chain = &self.chain;
        self.entries
            .sort_by_key(|e| chain.iter().position(|n| *n == e.name).unwrap_or(usize::MAX));
    }
}

/// Decrements the backend's in-flight count when dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub health: BackendHealth,
    pub draining: bool,
    pub in_flight: usize,
    pub operations: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub capabilities: BackendCapabilities,
    pub performance: PerformanceMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub backends: Vec<BackendStatus>,
    pub healthy_backends: usize,
    pub total_operations: u64,
    pub total_failures: u64,
    pub total_commands: u64,
    pub avg_latency_ms: f64,
}

pub struct BackendManager {
    config: BackendConfig,
    audit: Arc<AuditLogger>,
    state: Mutex<State>,
    rng: Mutex<StdRng>,
    cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl BackendManager {
    pub fn new(config: BackendConfig, audit: Arc<AuditLogger>) -> Self {
        let state = State {
            chain: config.fallback_chain.clone(),
            ..State::default()
        };
        Self {
            config,
            audit,
            state: Mutex::new(state),
            rng: Mutex::new(StdRng::from_entropy()),
            cancel: CancellationToken::new(),
            health_task: Mutex::new(None),
        }
    }

    /// Add a backend. Names must be unique.
    pub fn register(&self, backend: Arc<dyn TerminalBackend>) -> Result<(), MuxError> {
        let mut state = self.state.lock();
        if state.position(backend.name()).is_some() {
            return Err(MuxError::Validation(format!(
                "backend `{}` is already registered",
                backend.name()
            )));
        }
        info!(backend = backend.name(), "backend registered");
        state.insert(Entry::new(backend));
        Ok(())
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.state.lock().entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Initialize every backend. One that fails starts out unhealthy; the
    /// call only fails when none came up.
    pub async fn initialize(&self) -> Result<(), MuxError> {
        let backends = self.snapshot();
        let mut ready = 0;
        for (name, backend) in &backends {
            match backend.initialize().await {
                Ok(()) => ready += 1,
                Err(e) => {
                    warn!(backend = %name, error = %e, "backend failed to initialize");
                    let mut state = self.state.lock();
                    if let Some(pos) = state.position(name) {
                        let health = &mut state.entries[pos].health;
                        health.healthy = false;
                        health.consecutive_failures = self.config.failure_threshold;
                        health.details.insert("error".to_string(), e.to_string());
                    }
                }
            }
        }
        if ready == 0 && !backends.is_empty() {
            return Err(MuxError::BackendUnavailable(
                "no backend initialized".to_string(),
            ));
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn TerminalBackend>)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.backend.clone()))
            .collect()
    }

    fn attempt_order(
        &self,
        session: Option<&str>,
    ) -> Vec<(String, Arc<dyn TerminalBackend>, Arc<AtomicUsize>)> {
        let mut state = self.state.lock();
        let candidates: Vec<Candidate> = state
            .entries
            .iter()
            .map(|e| Candidate {
                name: e.name.clone(),
                healthy: e.health.healthy,
                draining: e.draining,
                in_flight: e.in_flight.load(Ordering::Acquire),
                avg_latency_ms: e.avg_latency_ms(),
                weight: self.config.weights.get(&e.name).copied().unwrap_or(1),
            })
            .collect();
        let mut order = plan(
            self.config.strategy,
            &candidates,
            state.round_robin,
            &mut *self.rng.lock(),
        );
        state.round_robin = state.round_robin.wrapping_add(1);

        if let Some(owner) = session.and_then(|id| state.affinity.get(id)) {
            if let Some(pos) = order.iter().position(|&i| candidates[i].name == *owner) {
                let preferred = order.remove(pos);
                order.insert(0, preferred);
            }
        }
        order
            .into_iter()
            .map(|i| {
                let entry = &state.entries[i];
                (
                    entry.name.clone(),
                    entry.backend.clone(),
                    entry.in_flight.clone(),
                )
            })
            .collect()
    }

    fn record(&self, name: &str, elapsed: Duration, ok: bool) {
        let mut state = self.state.lock();
        if let Some(pos) = state.position(name) {
            let entry = &mut state.entries[pos];
            entry.operations += 1;
            if ok {
                entry.latency_micros += elapsed.as_micros() as u64;
            } else {
                entry.failures += 1;
            }
        }
    }

    /// Run `op` on the strategy's pick. Retryable failures move on to the next
    /// eligible backend, at most `max_retries` times, `retry_delay_ms` apart.
    /// Returns the serving backend's name with the result.
    async fn route<T, F, Fut>(
        &self,
        operation: &str,
        session: Option<&str>,
        op: F,
    ) -> Result<(String, T), MuxError>
    where
        F: Fn(Arc<dyn TerminalBackend>) -> Fut,
        Fut: Future<Output = Result<T, MuxError>>,
    {
        let order = self.attempt_order(session);
        if order.is_empty() {
            warn!(operation, "no eligible backend");
            return Err(MuxError::BackendUnavailable(format!(
                "no eligible backend for {operation}"
            )));
        }
        let attempts = order.len().min(self.config.max_retries + 1);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut last_error = None;
        for (attempt, (name, backend, in_flight)) in order.into_iter().take(attempts).enumerate() {
            if attempt > 0 && !retry_delay.is_zero() {
                tokio::time::sleep(retry_delay).await;
            }
            let guard = InFlight::enter(in_flight);
            let started = Instant::now();
            let result = op(backend).await;
            drop(guard);
            self.record(&name, started.elapsed(), result.is_ok());
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, backend = %name, attempt, "served by fallback backend");
                    }
                    return Ok((name, value));
                }
                Err(e) if e.is_retryable() => {
                    warn!(operation, backend = %name, error = %e, "backend failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            MuxError::BackendUnavailable(format!("no backend completed {operation}"))
        }))
    }

    /// Route an arbitrary operation through selection and failover.
    pub async fn execute_with_backend<T, F, Fut>(
        &self,
        operation: &str,
        session: Option<&str>,
        op: F,
    ) -> Result<T, MuxError>
    where
        F: Fn(Arc<dyn TerminalBackend>) -> Fut,
        Fut: Future<Output = Result<T, MuxError>>,
    {
        self.route(operation, session, op).await.map(|(_, value)| value)
    }

    pub async fn create_session(&self, name: &str) -> Result<Session, MuxError> {
        let (owner, session) = self
            .route("create-session", None, |b| async move { b.create_session(name).await })
            .await?;
        self.state
            .lock()
            .affinity
            .insert(session.id.clone(), owner);
        Ok(session)
    }

    pub async fn destroy_session(&self, id: &str) -> Result<(), MuxError> {
        self.route("destroy-session", Some(id), |b| async move {
            b.destroy_session(id).await
        })
        .await?;
        self.state.lock().affinity.remove(id);
        Ok(())
    }

    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        pane_id: Option<&str>,
    ) -> Result<CommandExecution, MuxError> {
        self.execute_with_backend("execute-command", Some(session_id), |b| async move {
            b.execute_command(session_id, command, pane_id).await
        })
        .await
    }

    /// A batch fails over only while none of its commands has completed.
    /// After that the remainder is reported with the serving backend's error
    /// so no command runs twice.
    pub async fn execute_batch(&self, session_id: &str, commands: &[String]) -> BatchOutcome {
        let routed = self
            .route("execute-batch", Some(session_id), |b| async move {
                let mut outcome = b.execute_batch(session_id, commands).await;
                match outcome.error.take() {
                    Some(e) if outcome.executions.is_empty() => Err(e),
                    error => {
                        outcome.error = error;
                        Ok(outcome)
                    }
                }
            })
            .await;
        match routed {
            Ok((name, outcome)) => {
                if let Some(e) = &outcome.error {
                    warn!(
                        backend = %name,
                        completed = outcome.executions.len(),
                        total = commands.len(),
                        error = %e,
                        "batch stopped part way"
                    );
                }
                outcome
            }
            Err(e) => BatchOutcome::failed(e),
        }
    }

    pub async fn capture_output(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        lines: usize,
    ) -> Result<String, MuxError> {
        self.execute_with_backend("capture-output", Some(session_id), |b| async move {
            b.capture_output(session_id, pane_id, lines).await
        })
        .await
    }

    pub async fn start_continuous_capture(
        &self,
        session_id: &str,
        pane_id: Option<&str>,
        sink: mpsc::UnboundedSender<CaptureChunk>,
    ) -> Result<String, MuxError> {
        let (owner, capture_id) = self
            .route("start-capture", Some(session_id), |b| {
                let sink = sink.clone();
                async move { b.start_continuous_capture(session_id, pane_id, sink).await }
            })
            .await?;
        self.state
            .lock()
            .captures
            .insert(capture_id.clone(), owner);
        Ok(capture_id)
    }

    /// Stop a capture on the backend that started it.
    pub async fn stop_continuous_capture(&self, capture_id: &str) -> bool {
        let backend = {
            let mut state = self.state.lock();
            let owner = state.captures.remove(capture_id);
            owner
                .and_then(|name| state.position(&name))
                .map(|pos| state.entries[pos].backend.clone())
        };
        match backend {
            Some(backend) => backend.stop_continuous_capture(capture_id).await,
            None => false,
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, MuxError> {
        let (owner, sessions) = self
            .route("list-sessions", None, |b| async move { b.list_sessions().await })
            .await?;
        let mut state = self.state.lock();
        for session in &sessions {
            state
                .affinity
                .entry(session.id.clone())
                .or_insert_with(|| owner.clone());
        }
        Ok(sessions)
    }

    /// Backend that owns `session_id`, if known.
    pub fn session_owner(&self, session_id: &str) -> Option<String> {
        self.state.lock().affinity.get(session_id).cloned()
    }

    /// Probe every backend once and fold the results into their health.
    pub async fn run_health_checks(&self) {
        for (name, backend) in self.snapshot() {
            let probe = backend.perform_health_check().await;
            self.apply_health(&name, probe);
        }
    }

    fn apply_health(&self, name: &str, mut probe: BackendHealth) {
        let transition = {
            let mut state = self.state.lock();
            let Some(pos) = state.position(name) else {
                return;
            };
            let entry = &mut state.entries[pos];
            let was_healthy = entry.health.healthy;
            if probe.healthy {
                probe.consecutive_failures = 0;
            } else {
                probe.consecutive_failures = entry.health.consecutive_failures.saturating_add(1);
                probe.healthy = probe.consecutive_failures < self.config.failure_threshold;
            }
            let failures = probe.consecutive_failures;
            entry.health = probe;
            (was_healthy != entry.health.healthy).then_some((entry.health.healthy, failures))
        };
        let Some((healthy, failures)) = transition else {
            return;
        };
        if healthy {
            info!(backend = name, "backend recovered");
        } else {
            warn!(backend = name, failures, "backend marked unhealthy");
        }
        let entry = AuditEntry::new(
            AuditEventType::BackendHealthChanged,
            COMPONENT,
            format!(
                "backend {name} is now {}",
                if healthy { "healthy" } else { "unhealthy" }
            ),
        )
        .meta("backend", name)
        .meta("consecutive_failures", failures);
        let entry = if healthy {
            entry.severity(Severity::Info).outcome(Outcome::Success).risk(1)
        } else {
            entry
        };
        self.audit.log(entry);
    }

    /// Spawn the periodic health check. Calling it again is a no-op.
    pub fn start_health_checks(self: &Arc<Self>) {
        let mut task = self.health_task.lock();
        if task.is_some() {
            return;
        }
        let every = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        *task = Some(tokio::spawn(health_loop(
            Arc::downgrade(self),
            self.cancel.clone(),
            every,
        )));
    }

    /// Put `new` in `old`'s place. New submissions go to `new` at once; `old`
    /// is detached and released after its in-flight operations finish or the
    /// drain timeout passes. Sessions are left running and move to `new`.
    pub async fn hot_swap(&self, old: &str, new: Arc<dyn TerminalBackend>) -> Result<(), MuxError> {
        let new_name = new.name().to_string();
        {
            let state = self.state.lock();
            if state.position(old).is_none() {
                return Err(MuxError::Validation(format!("unknown backend `{old}`")));
            }
            if state.position(&new_name).is_some() {
                return Err(MuxError::Validation(format!(
                    "backend `{new_name}` is already registered"
                )));
            }
        }
        new.initialize().await?;

        let in_flight = {
            let mut state = self.state.lock();
            let Some(pos) = state.position(old) else {
                return Err(MuxError::Validation(format!("unknown backend `{old}`")));
            };
            state.entries[pos].draining = true;
            let in_flight = state.entries[pos].in_flight.clone();
            match state.chain.iter().position(|n| n == old) {
                Some(i) => state.chain[i] = new_name.clone(),
                None => state.chain.push(new_name.clone()),
            }
            for owner in state.affinity.values_mut() {
                if owner == old {
                    *owner = new_name.clone();
                }
            }
            state.insert(Entry::new(new.clone()));
            in_flight
        };
        info!(old, new = %new_name, "hot swap started, draining old backend");

        let deadline = Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        while in_flight.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let remaining = in_flight.load(Ordering::Acquire);

        let detached = {
            let mut state = self.state.lock();
            let pos = state.position(old);
            state.captures.retain(|_, owner| owner != old);
            pos.map(|pos| state.entries.remove(pos).backend)
        };
        if remaining > 0 {
            warn!(old, remaining, "drain timeout passed, detaching with operations in flight");
        } else {
            info!(old, new = %new_name, "hot swap complete");
        }
        if let Some(backend) = detached {
            backend.release().await;
        }
        if let Err(e) = new.list_sessions().await {
            debug!(backend = %new_name, error = %e, "post-swap session discovery failed");
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map(|e| BackendStatus {
                name: e.name.clone(),
                health: e.health.clone(),
                draining: e.draining,
                in_flight: e.in_flight.load(Ordering::Acquire),
                operations: e.operations,
                failures: e.failures,
                avg_latency_ms: e.avg_latency_ms(),
                capabilities: e.backend.capabilities(),
                performance: e.backend.performance_metrics(),
            })
            .collect()
    }

    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        let backends = self.status();
        let total_operations: u64 = backends.iter().map(|b| b.operations).sum();
        let total_failures: u64 = backends.iter().map(|b| b.failures).sum();
        let succeeded = total_operations - total_failures;
        let weighted: f64 = backends
            .iter()
            .map(|b| b.avg_latency_ms * (b.operations - b.failures) as f64)
            .sum();
        AggregateMetrics {
            healthy_backends: backends.iter().filter(|b| b.health.healthy).count(),
            total_commands: backends.iter().map(|b| b.performance.total_commands).sum(),
            total_operations,
            total_failures,
            avg_latency_ms: if succeeded == 0 {
                0.0
            } else {
                weighted / succeeded as f64
            },
            backends,
        }
    }

    /// Stop health checks and shut every backend down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(error = %e, "health check task ended abnormally");
            }
        }
        for (name, backend) in self.snapshot() {
            backend.shutdown().await;
            debug!(backend = %name, "backend shut down");
        }
        info!("backend manager shut down");
    }
}

impl std::fmt::Debug for BackendManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendManager")
            .field("strategy", &self.config.strategy)
            .field("backends", &self.backend_names())
            .finish()
    }
}

async fn health_loop(manager: Weak<BackendManager>, cancel: CancellationToken, every: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.run_health_checks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionStrategy;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct ScriptedBackend {
        name: String,
        probe_ok: AtomicBool,
        error: Mutex<Option<MuxError>>,
        /// Fail only the call with this 1-based number.
        fail_at: Mutex<Option<(usize, MuxError)>>,
        delay: Mutex<Duration>,
        calls: AtomicUsize,
        released: AtomicBool,
    }

    impl ScriptedBackend {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                probe_ok: AtomicBool::new(true),
                error: Mutex::new(None),
                fail_at: Mutex::new(None),
                delay: Mutex::new(Duration::ZERO),
                calls: AtomicUsize::new(0),
                released: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn step(&self) -> Result<(), MuxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some((at, e)) = self.fail_at.lock().clone() {
                if at == call {
                    return Err(e);
                }
            }
            match self.error.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn session(&self, id: &str) -> Session {
            Session {
                id: id.to_string(),
                name: id.to_string(),
                tmux_id: "$0".to_string(),
                pid: None,
                created_at: 0,
                attached: false,
                windows: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl TerminalBackend for ScriptedBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                continuous_capture: false,
                session_recovery: false,
                batch_execution: true,
                max_concurrency: 1,
            }
        }

        async fn initialize(&self) -> Result<(), MuxError> {
            Ok(())
        }

        async fn create_session(&self, name: &str) -> Result<Session, MuxError> {
            self.step().await?;
            Ok(self.session(&format!("{}-{name}", self.name)))
        }

        async fn destroy_session(&self, _id: &str) -> Result<(), MuxError> {
            self.step().await
        }

        async fn execute_command(
            &self,
            session_id: &str,
            command: &str,
            _pane_id: Option<&str>,
        ) -> Result<CommandExecution, MuxError> {
            self.step().await?;
            Ok(CommandExecution {
                session_id: session_id.to_string(),
                window_id: None,
                pane_id: None,
                command: command.to_string(),
                submitted_at_ms: 0,
                execution_time: Duration::ZERO,
                output: Some(self.name.clone()),
                error: None,
            })
        }

        async fn capture_output(
            &self,
            _session_id: &str,
            _pane_id: Option<&str>,
            _lines: usize,
        ) -> Result<String, MuxError> {
            self.step().await?;
            Ok(self.name.clone())
        }

        async fn start_continuous_capture(
            &self,
            _session_id: &str,
            _pane_id: Option<&str>,
            _sink: mpsc::UnboundedSender<CaptureChunk>,
        ) -> Result<String, MuxError> {
            Err(MuxError::Validation("capture unsupported".into()))
        }

        async fn stop_continuous_capture(&self, _capture_id: &str) -> bool {
            false
        }

        async fn list_sessions(&self) -> Result<Vec<Session>, MuxError> {
            Ok(Vec::new())
        }

        async fn perform_health_check(&self) -> BackendHealth {
            BackendHealth {
                healthy: self.probe_ok.load(Ordering::SeqCst),
                ..BackendHealth::default()
            }
        }

        fn performance_metrics(&self) -> PerformanceMetrics {
            PerformanceMetrics::default()
        }

        async fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }

        async fn shutdown(&self) {}
    }

    fn manager(strategy: SelectionStrategy, chain: &[&str]) -> BackendManager {
        let config = BackendConfig {
            strategy,
            fallback_chain: chain.iter().map(|s| s.to_string()).collect(),
            retry_delay_ms: 10,
            ..BackendConfig::default()
        };
        BackendManager::new(config, Arc::new(AuditLogger::new(100)))
    }

    fn served_by(execution: &CommandExecution) -> &str {
        execution.output.as_deref().unwrap_or_default()
    }

    #[tokio::test]
    async fn three_failed_health_checks_move_traffic_to_fallback() {
        let manager = manager(SelectionStrategy::PrimaryFallback, &["a", "b"]);
        let (a, b) = (ScriptedBackend::new("a"), ScriptedBackend::new("b"));
        manager.register(b.clone()).unwrap();
        manager.register(a.clone()).unwrap();
        assert_eq!(manager.backend_names(), vec!["a", "b"]);

        a.probe_ok.store(false, Ordering::SeqCst);
        for _ in 0..2 {
            manager.run_health_checks().await;
        }
        let session = manager.create_session("s").await.unwrap();
        assert_eq!(session.id, "a-s");

        manager.run_health_checks().await;
        let session = manager.create_session("s").await.unwrap();
        assert_eq!(session.id, "b-s");
        assert_eq!(manager.session_owner("b-s").as_deref(), Some("b"));

        let changes = manager.audit.query(&crate::security::AuditFilter {
            event_type: Some(AuditEventType::BackendHealthChanged),
            ..Default::default()
        });
        assert_eq!(changes.len(), 1);

        a.probe_ok.store(true, Ordering::SeqCst);
        manager.run_health_checks().await;
        assert!(manager.status()[0].health.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_fall_through_the_chain() {
        let manager = manager(SelectionStrategy::PrimaryFallback, &["a", "b"]);
        let (a, b) = (ScriptedBackend::new("a"), ScriptedBackend::new("b"));
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();
        *a.error.lock() = Some(MuxError::Connection("control client exited".into()));

        let output = manager.capture_output("x", None, 10).await.unwrap();
        assert_eq!(output, "b");
        assert_eq!((a.calls(), b.calls()), (1, 1));
        let status = manager.status();
        assert_eq!((status[0].operations, status[0].failures), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_fails_over_only_before_any_command_ran() {
        let manager = manager(SelectionStrategy::PrimaryFallback, &["a", "b"]);
        let (a, b) = (ScriptedBackend::new("a"), ScriptedBackend::new("b"));
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();
        let commands: Vec<String> = ["echo a", "echo b", "make slow", "echo c"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        *a.fail_at.lock() = Some((3, MuxError::timeout("send-keys", Duration::from_secs(5))));
        let outcome = manager.execute_batch("x", &commands).await;
        let ran: Vec<&str> = outcome.executions.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(ran, vec!["echo a", "echo b"]);
        assert!(matches!(outcome.error, Some(MuxError::Timeout { .. })));
        assert_eq!((a.calls(), b.calls()), (3, 0));

        *a.error.lock() = Some(MuxError::Connection("control client exited".into()));
        let outcome = manager.execute_batch("x", &commands).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.executions.len(), 4);
        assert!(outcome.executions.iter().all(|e| served_by(e) == "b"));
        assert_eq!((a.calls(), b.calls()), (4, 4));
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let manager = manager(SelectionStrategy::PrimaryFallback, &["a", "b"]);
        let (a, b) = (ScriptedBackend::new("a"), ScriptedBackend::new("b"));
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();
        *a.error.lock() = Some(MuxError::Security("command contains `;`".into()));

        let err = manager.execute_command("x", "ls; id", None).await.unwrap_err();
        assert_eq!(err, MuxError::Security("command contains `;`".into()));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn no_eligible_backend_is_unavailable() {
        let manager = manager(SelectionStrategy::HealthBased, &["a"]);
        let a = ScriptedBackend::new("a");
        manager.register(a.clone()).unwrap();
        a.probe_ok.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            manager.run_health_checks().await;
        }
        let err = manager.create_session("s").await.unwrap_err();
        assert!(matches!(err, MuxError::BackendUnavailable(_)));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn sessions_stick_to_their_backend() {
        let manager = manager(SelectionStrategy::RoundRobin, &["a", "b"]);
        let (a, b) = (ScriptedBackend::new("a"), ScriptedBackend::new("b"));
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();

        let first = manager.create_session("s").await.unwrap();
        let owner = manager.session_owner(&first.id).unwrap();
        for _ in 0..4 {
            let execution = manager.execute_command(&first.id, "ls", None).await.unwrap();
            assert_eq!(served_by(&execution), owner);
        }
        manager.destroy_session(&first.id).await.unwrap();
        assert!(manager.session_owner(&first.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hot_swap_drains_in_flight_work() {
        let manager = Arc::new(manager(SelectionStrategy::PrimaryFallback, &["a", "b"]));
        let (a, b, c) = (
            ScriptedBackend::new("a"),
            ScriptedBackend::new("b"),
            ScriptedBackend::new("c"),
        );
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();
        let session = manager.create_session("s").await.unwrap();

        *a.delay.lock() = Duration::from_millis(50);
        let slow = {
            let manager = manager.clone();
            let id = session.id.clone();
            tokio::spawn(async move { manager.execute_command(&id, "sleep", None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(manager.status()[0].in_flight, 1);

        manager.hot_swap("a", c.clone()).await.unwrap();
        assert!(a.released.load(Ordering::SeqCst));
        assert!(!b.released.load(Ordering::SeqCst) && !c.released.load(Ordering::SeqCst));
        let execution = slow.await.unwrap().unwrap();
        assert_eq!(served_by(&execution), "a");
        assert_eq!(manager.backend_names(), vec!["c", "b"]);
        assert_eq!(manager.session_owner(&session.id).as_deref(), Some("c"));

        let execution = manager.execute_command(&session.id, "ls", None).await.unwrap();
        assert_eq!(served_by(&execution), "c");
        assert!(manager.hot_swap("a", ScriptedBackend::new("d")).await.is_err());
    }

    #[tokio::test]
    async fn aggregate_metrics_sum_backends() {
        let manager = manager(SelectionStrategy::PrimaryFallback, &["a", "b"]);
        let (a, b) = (ScriptedBackend::new("a"), ScriptedBackend::new("b"));
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();
        manager.capture_output("x", None, 1).await.unwrap();
        manager.capture_output("x", None, 1).await.unwrap();
        let metrics = manager.aggregate_metrics();
        assert_eq!(metrics.total_operations, 2);
        assert_eq!(metrics.total_failures, 0);
        assert_eq!(metrics.healthy_backends, 2);
        assert_eq!(metrics.backends.len(), 2);
        assert!(manager.register(ScriptedBackend::new("a")).is_err());
    }
}

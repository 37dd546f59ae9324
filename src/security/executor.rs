//! Admission-controlled execution of allow-listed operations.
//!
//! Pipeline for every call: allow-list lookup, per-field validation, render,
//! post-render argv scan, rate limit, concurrency slot, transport. Every
//! rejection and every outcome is written to the [`AuditLogger`].
//!
//! Callers that deliver invocations some other way (the control-mode
//! batcher) go through [`SecureCommandExecutor::execute_with`] so the same
//! admission and audit apply.

use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{SecurityConfig, TmuxConfig};
use crate::error::{ErrorKind, MuxError};
use crate::textutil::truncate_with_suffix_by_chars;
use crate::tmux::{is_no_server_error, MuxOperation, OperationParams, OperationType};
use crate::transport::{ExecOutput, MuxTransport, StreamProcess};

use super::audit::{AuditEntry, AuditEventType, AuditLogger, ClientInfo, Outcome, Severity};
use super::rate_limit::RateLimiter;
use super::validator::{find_metacharacter, InputValidator};

const COMPONENT: &str = "executor";

/// Who is asking. `source` keys the rate limiter.
///
/// Internal contexts belong to background work such as the periodic
/// refresh. They are validated, audited and take a concurrency slot like any
/// other request but do not spend rate-limit budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub source: String,
    pub client: Option<ClientInfo>,
    pub internal: bool,
}

impl RequestContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            client: None,
            internal: false,
        }
    }

    pub fn internal(source: impl Into<String>) -> Self {
        Self {
            internal: true,
            ..Self::new(source)
        }
    }

    pub fn with_client(mut self, client: ClientInfo) -> Self {
        self.client = Some(client);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub elapsed: Duration,
}

/// An operation that passed validation and rate limiting.
///
/// `invocations` exclude the binary and socket flags, so they can be sent
/// over a control-mode connection as well as spawned directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub op: MuxOperation,
    pub invocations: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub executed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub rate_limited: u64,
    pub concurrency_limited: u64,
    pub available_slots: usize,
}

#[derive(Debug, Default)]
struct Counters {
    executed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    rate_limited: AtomicU64,
    concurrency_limited: AtomicU64,
}

pub struct SecureCommandExecutor {
    binary: String,
    socket_path: PathBuf,
    timeout: Duration,
    audit_command_chars: usize,
    validator: InputValidator,
    limiter: Mutex<RateLimiter>,
    slots: Arc<Semaphore>,
    transport: Arc<dyn MuxTransport>,
    audit: Arc<AuditLogger>,
    closed: AtomicBool,
    counters: Counters,
}

impl SecureCommandExecutor {
    pub fn new(
        tmux: &TmuxConfig,
        security: &SecurityConfig,
        transport: Arc<dyn MuxTransport>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, MuxError> {
        let validator = InputValidator::new(security.max_command_length)?;
        validator.validate_socket_path(&tmux.socket_path)?;
        if let Some(shell) = &tmux.default_shell {
            validator.validate_shell(shell)?;
        }
        Ok(Self {
            binary: tmux.binary.clone(),
            socket_path: tmux.socket_path.clone(),
            timeout: tmux.command_timeout(),
            audit_command_chars: security.audit_command_chars,
            validator,
            limiter: Mutex::new(RateLimiter::new(
                Duration::from_millis(security.rate_limit_window_ms),
                security.rate_limit_max_requests,
                Duration::from_millis(security.rate_limit_block_ms),
            )),
            slots: Arc::new(Semaphore::new(security.max_concurrent_commands.max(1))),
            transport,
            audit,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    pub fn command_timeout(&self) -> Duration {
        self.timeout
    }

    fn base_argv(&self) -> Vec<String> {
        vec![
            self.binary.clone(),
            "-S".to_string(),
            self.socket_path.display().to_string(),
        ]
    }

    fn full_argv(&self, invocation: &[String]) -> Vec<String> {
        let mut argv = self.base_argv();
        argv.extend(invocation.iter().cloned());
        argv
    }

    fn truncated(&self, text: &str) -> String {
        truncate_with_suffix_by_chars(text, self.audit_command_chars, "...")
    }

    fn entry(
        &self,
        event_type: AuditEventType,
        operation: &str,
        description: String,
        ctx: &RequestContext,
    ) -> AuditEntry {
        AuditEntry::new(event_type, COMPONENT, description)
            .meta("operation", operation)
            .meta("source", ctx.source.as_str())
            .client(ctx.client.clone())
    }

    fn audit_rejection(
        &self,
        operation: &str,
        command: Option<&str>,
        err: &MuxError,
        ctx: &RequestContext,
    ) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let event_type = match err.kind() {
            ErrorKind::Security => AuditEventType::SecurityViolation,
            _ => AuditEventType::ValidationFailed,
        };
        let mut entry = self
            .entry(event_type, operation, format!("rejected {operation}: {err}"), ctx)
            .meta("error_kind", format!("{:?}", err.kind()));
        if let Some(command) = command {
            entry = entry.meta("command", self.truncated(command));
        }
        if event_type == AuditEventType::SecurityViolation {
            warn!(operation, source = %ctx.source, "security violation rejected");
        }
        self.audit.log(entry);
    }

    /// Allow-list and validate a string-typed request. Never touches the
    /// transport and never consumes rate-limit budget.
    pub fn validate_command(
        &self,
        op_type: &str,
        params: OperationParams,
        ctx: &RequestContext,
    ) -> Result<MuxOperation, MuxError> {
        let label = self.truncated(op_type);
        let command = params.text.clone();
        let result = op_type
            .parse::<OperationType>()
            .and_then(|op| MuxOperation::from_params(op, params))
            .and_then(|op| self.check_operation(&op).map(|_| op));
        if let Err(e) = &result {
            self.audit_rejection(&label, command.as_deref(), e, ctx);
        }
        result
    }

    fn check_operation(&self, op: &MuxOperation) -> Result<Vec<Vec<String>>, MuxError> {
        self.validator.validate_operation(op)?;
        let invocations = op.render();
        for invocation in &invocations {
            self.validator.scan_argv(&self.full_argv(invocation))?;
        }
        Ok(invocations)
    }

    fn admit(&self, op: &MuxOperation, ctx: &RequestContext) -> Result<(), MuxError> {
        if ctx.internal {
            return Ok(());
        }
        let decision = self.limiter.lock().check(&ctx.source);
        match decision {
            Ok(remaining) => {
                debug!(source = %ctx.source, remaining, "request admitted");
                Ok(())
            }
            Err(retry_after) => {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                let err = MuxError::RateLimitExceeded {
                    source: ctx.source.clone(),
                    retry_after_ms: retry_after.as_millis() as u64,
                };
                warn!(source = %ctx.source, retry_after_ms = retry_after.as_millis() as u64, "rate limit exceeded");
                let operation = op.op_type().as_str();
                self.audit.log(
                    self.entry(AuditEventType::RateLimitExceeded, operation, err.to_string(), ctx)
                        .meta("retry_after_ms", retry_after.as_millis() as u64),
                );
                Err(err)
            }
        }
    }

    /// Metacharacter screen for free text that never reaches argv itself,
    /// such as a human-readable session name.
    pub fn screen_text(
        &self,
        field: &str,
        value: &str,
        ctx: &RequestContext,
    ) -> Result<(), MuxError> {
        let Some(meta) = find_metacharacter(value) else {
            return Ok(());
        };
        let err = MuxError::Security(format!("{field} contains forbidden sequence `{meta}`"));
        self.audit_rejection(field, Some(value), &err, ctx);
        Err(err)
    }

    /// Validate, scan and rate-limit an operation without executing it.
    pub fn prepare(
        &self,
        op: &MuxOperation,
        ctx: &RequestContext,
    ) -> Result<PreparedCommand, MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Shutdown);
        }
        let invocations = match self.check_operation(op) {
            Ok(invocations) => invocations,
            Err(e) => {
                self.audit_rejection(op.op_type().as_str(), op.command_text(), &e, ctx);
                return Err(e);
            }
        };
        self.admit(op, ctx)?;
        Ok(PreparedCommand {
            op: op.clone(),
            invocations,
        })
    }

    /// String-boundary entry point: `op_type` must be on the allow-list.
    pub async fn execute_secure_command(
        &self,
        op_type: &str,
        params: OperationParams,
        ctx: &RequestContext,
    ) -> Result<CommandOutput, MuxError> {
        let op = self.validate_command(op_type, params, ctx)?;
        self.execute(&op, ctx).await
    }

    /// Execute by spawning the binary once per invocation.
    pub async fn execute(
        &self,
        op: &MuxOperation,
        ctx: &RequestContext,
    ) -> Result<CommandOutput, MuxError> {
        self.execute_with(op, ctx, |invocations| self.spawn_all(invocations))
            .await
    }

    /// Admit `op`, hold a concurrency slot while `runner` delivers the
    /// rendered invocations, then audit the outcome.
    pub async fn execute_with<F, Fut>(
        &self,
        op: &MuxOperation,
        ctx: &RequestContext,
        runner: F,
    ) -> Result<CommandOutput, MuxError>
    where
        F: FnOnce(Vec<Vec<String>>) -> Fut,
        Fut: Future<Output = Result<String, MuxError>>,
    {
        let prepared = self.prepare(op, ctx)?;
        let started = Instant::now();
        let permit = match tokio::time::timeout(self.timeout, self.slots.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(MuxError::Shutdown),
            Err(_) => {
                self.counters
                    .concurrency_limited
                    .fetch_add(1, Ordering::Relaxed);
                self.audit.log(self.entry(
                    AuditEventType::ConcurrencyLimited,
                    op.op_type().as_str(),
                    format!(
                        "{} waited {}ms for a slot",
                        op.summary(),
                        self.timeout.as_millis()
                    ),
                    ctx,
                ));
                return Err(MuxError::ConcurrencyLimit);
            }
        };

        let result = runner(prepared.invocations.clone()).await;
        drop(permit);

        let elapsed = started.elapsed();
        let result = result.map(|stdout| CommandOutput { stdout, elapsed });
        self.record_outcome(&prepared, ctx, &result, elapsed);
        result
    }

    async fn spawn_all(&self, invocations: Vec<Vec<String>>) -> Result<String, MuxError> {
        let mut stdout = String::new();
        for invocation in &invocations {
            let out = self
                .transport
                .run(&self.full_argv(invocation), self.timeout)
                .await?;
            if out.exit_code != 0 {
                return Err(self.exit_error(&out));
            }
            stdout.push_str(&out.stdout);
        }
        Ok(stdout)
    }

    /// Audit the outcome of an admitted command, whichever path ran it.
    pub fn record_outcome(
        &self,
        prepared: &PreparedCommand,
        ctx: &RequestContext,
        result: &Result<CommandOutput, MuxError>,
        elapsed: Duration,
    ) {
        let op_type = prepared.op.op_type();
        let mut entry = match result {
            Ok(_) => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                self.entry(
                    AuditEventType::CommandExecuted,
                    op_type.as_str(),
                    format!("executed {}", prepared.op.summary()),
                    ctx,
                )
                .risk(op_type.base_risk())
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let entry = self
                    .entry(
                        AuditEventType::CommandFailed,
                        op_type.as_str(),
                        format!("{} failed: {e}", prepared.op.summary()),
                        ctx,
                    )
                    .meta("error_kind", format!("{:?}", e.kind()));
                match e {
                    MuxError::Execution(msg) if is_no_server_error(msg) => {
                        entry.severity(Severity::Info).risk(0)
                    }
                    MuxError::Timeout { .. } => entry.risk(6),
                    _ => entry,
                }
            }
        };
        entry = entry.meta("elapsed_ms", elapsed.as_millis() as u64);
        if let Some(command) = prepared.op.command_text() {
            entry = entry.meta("command", self.truncated(command));
        }
        self.audit.log(entry);
    }

    /// Spawn a long-lived read-only control client for continuous capture.
    pub fn spawn_secure_process(
        &self,
        op: &MuxOperation,
        ctx: &RequestContext,
    ) -> Result<StreamProcess, MuxError> {
        if op.op_type() != OperationType::AttachSession {
            let err = MuxError::Validation(format!(
                "{} cannot run as a streaming process",
                op.op_type()
            ));
            self.audit_rejection(op.op_type().as_str(), None, &err, ctx);
            return Err(err);
        }
        let prepared = self.prepare(op, ctx)?;
        let invocation = prepared.invocations.first().cloned().unwrap_or_default();
        let stream = self.transport.spawn_stream(&self.full_argv(&invocation))?;
        self.audit.log(
            self.entry(
                AuditEventType::ProcessSpawned,
                op.op_type().as_str(),
                format!("spawned {}", op.summary()),
                ctx,
            )
            .outcome(Outcome::Success)
            .meta("pid", stream.pid.map(u64::from)),
        );
        Ok(stream)
    }

    /// Stable failure for a non-zero exit; the socket path is redacted.
    fn exit_error(&self, out: &ExecOutput) -> MuxError {
        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim()
        } else {
            out.stderr.trim()
        };
        let detail = if detail.is_empty() {
            format!("command exited with {}", out.exit_code)
        } else {
            detail.replace(&self.socket_path.display().to_string(), "<socket>")
        };
        MuxError::Execution(truncate_with_suffix_by_chars(&detail, 200, "..."))
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            concurrency_limited: self.counters.concurrency_limited.load(Ordering::Relaxed),
            available_slots: self.slots.available_permits(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new work. In-flight commands finish on their own permits.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        self.audit.log(AuditEntry::new(
            AuditEventType::ComponentShutdown,
            COMPONENT,
            "executor shut down",
        ));
    }
}

impl std::fmt::Debug for SecureCommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCommandExecutor")
            .field("binary", &self.binary)
            .field("timeout", &self.timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

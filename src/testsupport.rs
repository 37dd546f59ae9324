//! Shared test fixtures.
//!
//! `FakeMux` is an in-memory multiplexer used by the executor, pool, batcher
//! and session-manager tests. It answers the same argv vectors the real binary
//! would receive, over both the process transport and control-mode channels,
//! and records every invocation so tests can assert on transport traffic.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PerformanceMode};
use crate::error::MuxError;
use crate::tmux::{ControlChannel, ControlConnector, ControlReply};
use crate::transport::{ExecOutput, MuxTransport, StreamProcess};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    /// Create a unique temporary directory with a readable prefix.
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("muxctl-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a child path under the fixture root.
    pub fn child(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[derive(Debug, Clone)]
struct FakePane {
    id: String,
    pending: String,
    buffer: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeWindow {
    id: String,
    name: String,
    panes: Vec<FakePane>,
}

#[derive(Debug, Clone)]
struct FakeSession {
    name: String,
    id: String,
    created: u64,
    windows: Vec<FakeWindow>,
}

#[derive(Debug)]
struct FakeStream {
    session: String,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct FakeState {
    server_running: bool,
    sessions: Vec<FakeSession>,
    next_session: u64,
    next_window: u64,
    next_pane: u64,
    calls: Vec<Vec<String>>,
    control_batches: Vec<Vec<Vec<String>>>,
    delay: Duration,
    listing_delay: Duration,
    slow_arg: Option<(String, Duration)>,
    fail_connect: bool,
    fail_probe: bool,
    connects: u64,
    open_channels: usize,
    streams: Vec<FakeStream>,
}

/// In-memory tmux stand-in implementing both transport seams.
#[derive(Debug, Clone)]
pub struct FakeMux {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeMux {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMux {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                server_running: true,
                sessions: Vec::new(),
                next_session: 0,
                next_window: 0,
                next_pane: 0,
                calls: Vec::new(),
                control_batches: Vec::new(),
                delay: Duration::ZERO,
                listing_delay: Duration::ZERO,
                slow_arg: None,
                fail_connect: false,
                fail_probe: false,
                connects: 0,
                open_channels: 0,
                streams: Vec::new(),
            })),
        }
    }

    /// Defaults with a socket path that passes validation.
    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.tmux.socket_path = PathBuf::from("/tmp/muxctl-test/fake.sock");
        config.tmux.mode = PerformanceMode::Balanced;
        config.security.audit_log_path = None;
        config.pool.min_connections = 1;
        config.pool.max_connections = 4;
        config
    }

    /// Argv vectors received over the process transport.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Command lists received over control channels, one entry per round trip.
    pub fn control_batches(&self) -> Vec<Vec<Vec<String>>> {
        self.state.lock().control_batches.clone()
    }

    /// Latency applied to each process invocation and each control round trip.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Hold the reply to a server-wide `list-panes -a` for `delay` after the
    /// listing has been taken.
    pub fn set_listing_delay(&self, delay: Duration) {
        self.state.lock().listing_delay = delay;
    }

    /// Process invocations carrying `arg` take `delay` instead of the
    /// global latency.
    pub fn set_slow_arg(&self, arg: &str, delay: Duration) {
        self.state.lock().slow_arg = Some((arg.to_string(), delay));
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.state.lock().fail_probe = fail;
    }

    pub fn connects(&self) -> u64 {
        self.state.lock().connects
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().open_channels
    }

    /// Streaming clients that have not been cancelled.
    pub fn live_streams(&self) -> usize {
        self.state
            .lock()
            .streams
            .iter()
            .filter(|s| !s.cancel.is_cancelled())
            .count()
    }

    /// Create a session directly, bypassing call recording.
    pub fn add_session(&self, name: &str) -> String {
        let mut state = self.state.lock();
        state.server_running = true;
        create_session(&mut state, name, None).id
    }

    pub fn session_names(&self) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Id of the first pane of `session`.
    pub fn first_pane(&self, session: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .sessions
            .iter()
            .find(|s| s.name == session)
            .and_then(|s| s.windows.first())
            .and_then(|w| w.panes.first())
            .map(|p| p.id.clone())
    }

    /// Kill the server, every session on it and every attached client.
    pub fn stop_server(&self) {
        let mut state = self.state.lock();
        state.server_running = false;
        state.sessions.clear();
        state.streams.clear();
    }

    /// Push an `%output` notification to every stream attached to the pane's session.
    pub fn emit_output(&self, pane: &str, data: &str) {
        let state = self.state.lock();
        emit(&state, pane, data);
    }

    fn handle(&self, args: &[String]) -> ExecOutput {
        let mut state = self.state.lock();
        handle_command(&mut state, args)
    }
}

fn emit(state: &FakeState, pane: &str, data: &str) {
    let Some(owner) = state
        .sessions
        .iter()
        .find(|s| s.windows.iter().any(|w| w.panes.iter().any(|p| p.id == pane)))
    else {
        return;
    };
    for stream in &state.streams {
        if stream.session == owner.name && !stream.cancel.is_cancelled() {
            let _ = stream.tx.try_send(format!("%output {pane} {data}"));
        }
    }
}

fn create_session(state: &mut FakeState, name: &str, window_name: Option<&str>) -> FakeSession {
    let session = FakeSession {
        name: name.to_string(),
        id: format!("${}", state.next_session),
        created: 1_700_000_000 + state.next_session,
        windows: vec![FakeWindow {
            id: format!("@{}", state.next_window),
            name: window_name.unwrap_or("bash").to_string(),
            panes: vec![FakePane {
                id: format!("%{}", state.next_pane),
                pending: String::new(),
                buffer: Vec::new(),
            }],
        }],
    };
    state.next_session += 1;
    state.next_window += 1;
    state.next_pane += 1;
    state.sessions.push(session.clone());
    session
}

fn session_row(session: &FakeSession) -> String {
    let number = session.id.trim_start_matches('$');
    format!(
        "{}\t{}\t{}\t0\t{}",
        session.name,
        session.id,
        session.created,
        4000 + number.parse::<u64>().unwrap_or(0)
    )
}

fn tree_rows(session: &FakeSession) -> Vec<String> {
    let mut rows = Vec::new();
    for (w_index, window) in session.windows.iter().enumerate() {
        for (p_index, pane) in window.panes.iter().enumerate() {
            let pane_number = pane.id.trim_start_matches('%');
            rows.push(format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t80\t24\tbash\t{}",
                session_row(session),
                window.id,
                w_index,
                window.name,
                u8::from(w_index == 0),
                pane.id,
                p_index,
                u8::from(p_index == 0),
                5000 + pane_number.parse::<u64>().unwrap_or(0)
            ));
        }
    }
    rows
}

fn lines_out(rows: Vec<String>) -> ExecOutput {
    let mut out = rows.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    ExecOutput::success(out)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn session_name(target: &str) -> &str {
    let target = target.trim_start_matches('=');
    target.split(':').next().unwrap_or(target)
}

fn find_pane<'a>(state: &'a mut FakeState, target: &str) -> Option<&'a mut FakePane> {
    if target.starts_with('%') {
        return state
            .sessions
            .iter_mut()
            .flat_map(|s| s.windows.iter_mut())
            .flat_map(|w| w.panes.iter_mut())
            .find(|p| p.id == target);
    }
    let name = session_name(target);
    state
        .sessions
        .iter_mut()
        .find(|s| s.name == name)
        .and_then(|s| s.windows.first_mut())
        .and_then(|w| w.panes.first_mut())
}

fn handle_command(state: &mut FakeState, args: &[String]) -> ExecOutput {
    let Some(command) = args.first().map(String::as_str) else {
        return ExecOutput::failure(1, "usage: tmux command");
    };
    if command == "start-server" {
        state.server_running = true;
        return ExecOutput::success("");
    }
    if !state.server_running && command != "new-session" {
        return ExecOutput::failure(1, "no server running on /tmp/muxctl-test/fake.sock");
    }
    match command {
        "new-session" => {
            let Some(name) = flag_value(args, "-s") else {
                return ExecOutput::failure(1, "missing session name");
            };
            if state.sessions.iter().any(|s| s.name == name) {
                return ExecOutput::failure(1, format!("duplicate session: {name}"));
            }
            state.server_running = true;
            let window = flag_value(args, "-n").map(str::to_string);
            let session = create_session(state, name, window.as_deref());
            if args.iter().any(|a| a == "-P") {
                lines_out(tree_rows(&session))
            } else {
                ExecOutput::success("")
            }
        }
        "kill-session" | "has-session" => {
            let name = session_name(flag_value(args, "-t").unwrap_or_default()).to_string();
            let Some(pos) = state.sessions.iter().position(|s| s.name == name) else {
                return ExecOutput::failure(1, format!("can't find session: {name}"));
            };
            if command == "kill-session" {
                state.sessions.remove(pos);
            }
            ExecOutput::success("")
        }
        "send-keys" => {
            let target = flag_value(args, "-t").unwrap_or_default().to_string();
            let literal = args.iter().any(|a| a == "-l");
            let mut echoed = Vec::new();
            let pane_id = {
                let Some(pane) = find_pane(state, &target) else {
                    return ExecOutput::failure(1, format!("can't find pane: {target}"));
                };
                if literal {
                    let text = args
                        .iter()
                        .position(|a| a == "--")
                        .and_then(|i| args.get(i + 1));
                    if let Some(text) = text {
                        pane.pending.push_str(text);
                    }
                } else if args.last().map(String::as_str) == Some("Enter") {
                    let line = std::mem::take(&mut pane.pending);
                    pane.buffer.push(format!("$ {line}"));
                    if let Some(rest) = line.strip_prefix("echo ") {
                        pane.buffer.push(rest.to_string());
                        echoed.push(rest.to_string());
                    }
                }
                pane.id.clone()
            };
            for line in echoed {
                emit(state, &pane_id, &line);
            }
            ExecOutput::success("")
        }
        "capture-pane" => {
            let target = flag_value(args, "-t").unwrap_or_default().to_string();
            let start = flag_value(args, "-S").and_then(|s| s.parse::<i64>().ok());
            let Some(pane) = find_pane(state, &target) else {
                return ExecOutput::failure(1, format!("can't find pane: {target}"));
            };
            let mut lines = pane.buffer.clone();
            if let Some(start) = start.filter(|s| *s < 0) {
                let keep = start.unsigned_abs() as usize;
                let skip = lines.len().saturating_sub(keep);
                lines.drain(..skip);
            }
            lines_out(lines)
        }
        "list-sessions" => lines_out(state.sessions.iter().map(session_row).collect()),
        "list-windows" => {
            let name = session_name(flag_value(args, "-t").unwrap_or_default()).to_string();
            let Some(session) = state.sessions.iter().find(|s| s.name == name) else {
                return ExecOutput::failure(1, format!("can't find session: {name}"));
            };
            lines_out(
                session
                    .windows
                    .iter()
                    .enumerate()
                    .map(|(i, w)| format!("{}\t{i}\t{}\t{}", w.id, w.name, u8::from(i == 0)))
                    .collect(),
            )
        }
        "list-panes" => {
            if args.iter().any(|a| a == "-a") {
                return lines_out(state.sessions.iter().flat_map(tree_rows).collect());
            }
            let name = session_name(flag_value(args, "-t").unwrap_or_default()).to_string();
            match state.sessions.iter().find(|s| s.name == name) {
                Some(session) => lines_out(tree_rows(session)),
                None => ExecOutput::failure(1, format!("can't find session: {name}")),
            }
        }
        "pipe-pane" => ExecOutput::success(""),
        "display-message" => {
            if state.fail_probe {
                return ExecOutput::failure(1, "probe refused");
            }
            ExecOutput::success(format!("{}\n", args.last().cloned().unwrap_or_default()))
        }
        other => ExecOutput::failure(1, format!("unknown command: {other}")),
    }
}

#[async_trait]
impl MuxTransport for FakeMux {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<ExecOutput, MuxError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(argv.to_vec());
            match &state.slow_arg {
                Some((arg, slow)) if argv.contains(arg) => *slow,
                _ => state.delay,
            }
        };
        let operation = argv.get(3).cloned().unwrap_or_default();
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(MuxError::timeout(operation, timeout));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let args = argv.get(3..).unwrap_or_default();
        let output = self.handle(args);
        let listing_delay = self.state.lock().listing_delay;
        let full_listing =
            args.first().is_some_and(|a| a == "list-panes") && args.iter().any(|a| a == "-a");
        if full_listing && !listing_delay.is_zero() {
            tokio::time::sleep(listing_delay).await;
        }
        Ok(output)
    }

    fn spawn_stream(&self, argv: &[String]) -> Result<StreamProcess, MuxError> {
        let mut state = self.state.lock();
        state.calls.push(argv.to_vec());
        let session = session_name(flag_value(argv, "-t").unwrap_or_default()).to_string();
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        state.streams.push(FakeStream {
            session,
            tx,
            cancel: cancel.clone(),
        });
        Ok(StreamProcess::new(rx, Some(9000), cancel))
    }
}

#[async_trait]
impl ControlConnector for FakeMux {
    async fn connect(&self) -> Result<Box<dyn ControlChannel>, MuxError> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(MuxError::Connection("control client exited".into()));
        }
        state.connects += 1;
        state.open_channels += 1;
        Ok(Box::new(FakeChannel {
            mux: self.clone(),
            open: true,
            counted: true,
            next_number: 0,
        }))
    }
}

struct FakeChannel {
    mux: FakeMux,
    open: bool,
    counted: bool,
    next_number: u64,
}

impl FakeChannel {
    fn uncount(&mut self) {
        if self.counted {
            self.counted = false;
            self.mux.state.lock().open_channels -= 1;
        }
    }
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn execute_many(
        &mut self,
        commands: &[Vec<String>],
        limit: Duration,
    ) -> Result<Vec<ControlReply>, MuxError> {
        if !self.open {
            return Err(MuxError::Connection("control channel is closed".into()));
        }
        let delay = {
            let mut state = self.mux.state.lock();
            state.control_batches.push(commands.to_vec());
            state.delay
        };
        if delay > limit {
            tokio::time::sleep(limit).await;
            self.open = false;
            return Err(MuxError::timeout("control batch", limit));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let out = self.mux.handle(command);
            self.next_number += 1;
            let text = if out.exit_code == 0 { out.stdout } else { out.stderr };
            replies.push(ControlReply {
                command_number: self.next_number,
                success: out.exit_code == 0,
                lines: text.lines().map(str::to_string).collect(),
            });
        }
        Ok(replies)
    }

    async fn close(&mut self) {
        self.open = false;
        self.uncount();
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.uncount();
    }
}

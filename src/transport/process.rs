//! Real child-process transport built on `tokio::process`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MuxError;

use super::{ExecOutput, MuxTransport, StreamProcess};

const STREAM_CHANNEL_CAPACITY: usize = 1024;

/// Spawns the multiplexer binary directly for every invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessTransport;

impl ProcessTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MuxTransport for ProcessTransport {
    async fn run(&self, argv: &[String], limit: Duration) -> Result<ExecOutput, MuxError> {
        let (program, args) = split_argv(argv)?;
        match timeout(limit, run_process(program, args)).await {
            Ok(out) => out,
            // The child is killed when the dropped future releases it.
            Err(_) => Err(MuxError::timeout(operation_name(args), limit)),
        }
    }

    fn spawn_stream(&self, argv: &[String]) -> Result<StreamProcess, MuxError> {
        let (program, args) = split_argv(argv)?;
        let mut cmd = Command::new(program);
        cmd.kill_on_drop(true);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| spawn_error(program, &e))?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MuxError::Connection(format!("{program}: stdout unavailable")))?;
        // Holding stdin open keeps control-mode clients attached.
        let stdin = child.stdin.take();

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let program = program.to_string();
        tokio::spawn(async move {
            let _stdin = stdin;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(program = %program, error = %e.kind(), "stream read failed");
                            break;
                        }
                    },
                }
            }
            if let Err(e) = child.kill().await {
                debug!(program = %program, error = %e.kind(), "stream child already exited");
            }
        });

        Ok(StreamProcess::new(rx, pid, cancel))
    }
}

fn split_argv(argv: &[String]) -> Result<(&str, &[String]), MuxError> {
    argv.split_first()
        .map(|(program, args)| (program.as_str(), args))
        .ok_or_else(|| MuxError::Validation("empty argument vector".into()))
}

/// First non-flag argument, used to name timeouts (`send-keys`, ...).
fn operation_name(args: &[String]) -> String {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-S" {
            iter.next();
            continue;
        }
        if !arg.starts_with('-') {
            return arg.clone();
        }
    }
    "command".to_string()
}

fn spawn_error(program: &str, e: &std::io::Error) -> MuxError {
    // The OS message can carry paths; only the error kind crosses the boundary.
    MuxError::Connection(format!("{program}: failed to start ({})", e.kind()))
}

/// Spawn and wait for a process.
pub(super) async fn run_process(program: &str, args: &[String]) -> Result<ExecOutput, MuxError> {
    let mut cmd = Command::new(program);
    // Timeouts drop this future; the child must not outlive it.
    cmd.kill_on_drop(true);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| spawn_error(program, &e))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| MuxError::Connection(format!("{program}: {}", e.kind())))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

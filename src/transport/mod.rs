//! Process transport seam between the executor and the multiplexer binary.
//!
//! `SecureCommandExecutor` is the only caller. Tests substitute
//! `testsupport::FakeMux`, which records every argv it receives.

mod process;

pub use process::ProcessTransport;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;

/// Captured output from one finished invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// A long-lived child process whose stdout is delivered line by line.
///
/// Dropping the handle cancels the reader, which kills the child.
#[derive(Debug)]
pub struct StreamProcess {
    pub lines: mpsc::Receiver<String>,
    pub pid: Option<u32>,
    cancel: CancellationToken,
}

impl StreamProcess {
    pub fn new(lines: mpsc::Receiver<String>, pid: Option<u32>, cancel: CancellationToken) -> Self {
        Self { lines, pid, cancel }
    }

    /// Token that terminates the child when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Executes fully-rendered argv vectors.
///
/// `argv[0]` is the program; it is never interpreted by a shell.
#[async_trait]
pub trait MuxTransport: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<ExecOutput, MuxError>;

    fn spawn_stream(&self, argv: &[String]) -> Result<StreamProcess, MuxError>;
}

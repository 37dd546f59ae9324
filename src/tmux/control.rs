//! Persistent control-mode (`tmux -C`) connections.
//!
//! A control client reads one command per line on stdin and answers each with
//! a `%begin`/`%end` (or `%error`) framed block on stdout. Everything outside a
//! block is an asynchronous notification; channels used for command batches
//! ignore them.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::error::MuxError;

const PROBE_TOKEN: &str = "muxctl-probe";

/// One framed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub command_number: u64,
    pub success: bool,
    pub lines: Vec<String>,
}

impl ControlReply {
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }

    pub fn into_result(self) -> Result<String, MuxError> {
        if self.success {
            return Ok(self.output());
        }
        let detail = self
            .lines
            .iter()
            .find(|line| !line.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "command failed".to_string());
        Err(MuxError::Execution(detail))
    }
}

/// Incremental `%begin`/`%end`/`%error` reply framer.
#[derive(Debug, Default)]
pub struct ReplyFramer {
    open: Option<(u64, Vec<String>)>,
}

fn guard_number(line: &str) -> Option<u64> {
    // %begin <time> <number> <flags>
    line.split_whitespace().nth(2)?.parse().ok()
}

impl ReplyFramer {
    pub fn push_line(&mut self, line: &str) -> Option<ReplyEvent> {
        match self.open.take() {
            None => {
                if line.starts_with("%begin ") {
                    self.open = Some((guard_number(line).unwrap_or(0), Vec::new()));
                    None
                } else if line.starts_with("%exit") {
                    Some(ReplyEvent::Exited)
                } else {
                    None
                }
            }
            Some((number, mut lines)) => {
                let closing = line.starts_with("%end ") || line.starts_with("%error ");
                if closing && guard_number(line) == Some(number) {
                    return Some(ReplyEvent::Reply(ControlReply {
                        command_number: number,
                        success: line.starts_with("%end "),
                        lines,
                    }));
                }
                lines.push(line.to_string());
                self.open = Some((number, lines));
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    Reply(ControlReply),
    /// The server ended the control client.
    Exited,
}

/// Render an argv as one control-mode command line.
pub fn render_command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=%@,+".contains(c));
    if plain {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// A live control-mode client.
#[async_trait]
pub trait ControlChannel: Send {
    /// Send every command in one write and collect replies in order.
    async fn execute_many(
        &mut self,
        commands: &[Vec<String>],
        limit: Duration,
    ) -> Result<Vec<ControlReply>, MuxError>;

    /// Cheap round trip confirming the client still answers.
    async fn probe(&mut self, limit: Duration) -> bool {
        let probe = vec![vec![
            "display-message".to_string(),
            "-p".to_string(),
            PROBE_TOKEN.to_string(),
        ]];
        match self.execute_many(&probe, limit).await {
            Ok(replies) => replies
                .first()
                .map(|r| r.success && r.lines.iter().any(|l| l.trim() == PROBE_TOKEN))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn close(&mut self);
}

/// Opens control channels; the pool's only way to create connections.
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ControlChannel>, MuxError>;
}

/// Connector spawning `tmux -S <socket> -C new-session -A -s <control>`.
#[derive(Debug, Clone)]
pub struct TmuxControlConnector {
    binary: String,
    socket_path: PathBuf,
    control_session: String,
    timeout: Duration,
}

impl TmuxControlConnector {
    pub fn new(
        binary: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        control_session: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            socket_path: socket_path.into(),
            control_session: control_session.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ControlConnector for TmuxControlConnector {
    async fn connect(&self) -> Result<Box<dyn ControlChannel>, MuxError> {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd.arg("-S")
            .arg(&self.socket_path)
            .args(["-C", "new-session", "-A", "-s", &self.control_session])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| {
            MuxError::Connection(format!("{}: failed to start ({})", self.binary, e.kind()))
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(MuxError::Connection("control client pipes unavailable".into()));
        };

        let mut channel = TmuxControlChannel {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            framer: ReplyFramer::default(),
            broken: false,
        };
        // The attach command itself produces the first framed reply.
        let greeting = timeout(self.timeout, read_replies(&mut channel.lines, &mut channel.framer, 1))
            .await
            .map_err(|_| MuxError::timeout("control connect", self.timeout))??;
        if let Some(reply) = greeting.into_iter().next() {
            reply.into_result()?;
        }
        debug!(pid = ?channel.child.id(), "control client attached");
        Ok(Box::new(channel))
    }
}

struct TmuxControlChannel {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    framer: ReplyFramer,
    broken: bool,
}

async fn read_replies(
    lines: &mut Lines<BufReader<ChildStdout>>,
    framer: &mut ReplyFramer,
    expected: usize,
) -> Result<Vec<ControlReply>, MuxError> {
    let mut replies = Vec::with_capacity(expected);
    while replies.len() < expected {
        let line = lines
            .next_line()
            .await
            .map_err(|e| MuxError::Connection(format!("control read failed ({})", e.kind())))?
            .ok_or_else(|| MuxError::Connection("control client exited".into()))?;
        match framer.push_line(&line) {
            Some(ReplyEvent::Reply(reply)) => replies.push(reply),
            Some(ReplyEvent::Exited) => {
                return Err(MuxError::Connection("control client exited".into()))
            }
            None => {}
        }
    }
    Ok(replies)
}

#[async_trait]
impl ControlChannel for TmuxControlChannel {
    async fn execute_many(
        &mut self,
        commands: &[Vec<String>],
        limit: Duration,
    ) -> Result<Vec<ControlReply>, MuxError> {
        if self.broken {
            return Err(MuxError::Connection("control channel is closed".into()));
        }
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut payload = String::new();
        for command in commands {
            payload.push_str(&render_command_line(command));
            payload.push('\n');
        }
        let write = async {
            self.stdin.write_all(payload.as_bytes()).await?;
            self.stdin.flush().await
        };
        if let Err(e) = write.await {
            self.broken = true;
            return Err(MuxError::Connection(format!("control write failed ({})", e.kind())));
        }

        match timeout(limit, read_replies(&mut self.lines, &mut self.framer, commands.len())).await
        {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(e)) => {
                self.broken = true;
                Err(e)
            }
            Err(_) => {
                // Late replies would be attributed to the next batch.
                self.broken = true;
                Err(MuxError::timeout("control batch", limit))
            }
        }
    }

    async fn close(&mut self) {
        self.broken = true;
        if let Err(e) = self.stdin.shutdown().await {
            debug!(error = %e.kind(), "control stdin already closed");
        }
        if let Err(e) = self.child.kill().await {
            warn!(error = %e.kind(), "failed to stop control client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut ReplyFramer, lines: &[&str]) -> Vec<ReplyEvent> {
        lines.iter().filter_map(|l| framer.push_line(l)).collect()
    }

    #[test]
    fn frames_success_and_error_blocks() {
        let mut framer = ReplyFramer::default();
        let events = feed(
            &mut framer,
            &[
                "%session-changed $0 muxctl-control",
                "%begin 1700000000 11 1",
                "s1-1\t$1\t1700000000\t0\t42",
                "%end 1700000000 11 1",
                "%output %1 noise",
                "%begin 1700000001 12 1",
                "can't find session: =nope",
                "%error 1700000001 12 1",
            ],
        );
        assert_eq!(events.len(), 2);
        let ReplyEvent::Reply(ok) = &events[0] else {
            panic!("expected reply");
        };
        assert!(ok.success);
        assert_eq!(ok.command_number, 11);
        assert_eq!(ok.lines, vec!["s1-1\t$1\t1700000000\t0\t42"]);
        let ReplyEvent::Reply(err) = events[1].clone() else {
            panic!("expected reply");
        };
        assert_eq!(
            err.into_result().unwrap_err(),
            MuxError::Execution("can't find session: =nope".into())
        );
    }

    #[test]
    fn end_marker_with_other_number_is_block_content() {
        let mut framer = ReplyFramer::default();
        let events = feed(
            &mut framer,
            &["%begin 1 5 1", "%end 1 4 1", "%end 1 5 1"],
        );
        let [ReplyEvent::Reply(reply)] = events.as_slice() else {
            panic!("expected a single reply, got {events:?}");
        };
        assert_eq!(reply.lines, vec!["%end 1 4 1"]);
    }

    #[test]
    fn exit_notification_is_reported() {
        let mut framer = ReplyFramer::default();
        assert_eq!(framer.push_line("%exit"), Some(ReplyEvent::Exited));
    }

    #[test]
    fn command_lines_quote_non_plain_arguments() {
        let args: Vec<String> = ["send-keys", "-t", "%3", "-l", "--", "echo it's"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            render_command_line(&args),
            "send-keys -t %3 -l -- 'echo it'\\''s'"
        );
        let list = vec!["list-sessions".to_string(), "-F".to_string(), "#{a}\t#{b}".to_string()];
        assert_eq!(render_command_line(&list), "list-sessions -F '#{a}\t#{b}'");
    }
}

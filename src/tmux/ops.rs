//! Allow-listed multiplexer operations and their argument-vector rendering.
//!
//! Every call into tmux is expressed as a [`MuxOperation`]. Rendering never
//! produces shell text: each invocation is an argv passed to the binary
//! directly (or quoted into a control-mode command line by `tmux::control`).

use std::fmt;
use std::str::FromStr;

use crate::error::MuxError;

/// Tab-delimited listing formats. Fields are split on `\t` by `tmux::parse`.
pub const SESSION_FORMAT: &str =
    "#{session_name}\t#{session_id}\t#{session_created}\t#{session_attached}\t#{pid}";
pub const WINDOW_FORMAT: &str = "#{window_id}\t#{window_index}\t#{window_name}\t#{window_active}";
/// One row per pane carrying its session and window, so a single listing
/// rebuilds the whole session/window/pane tree.
pub const TREE_FORMAT: &str = concat!(
    "#{session_name}\t#{session_id}\t#{session_created}\t#{session_attached}\t#{pid}\t",
    "#{window_id}\t#{window_index}\t#{window_name}\t#{window_active}\t",
    "#{pane_id}\t#{pane_index}\t#{pane_active}\t#{pane_width}\t#{pane_height}\t",
    "#{pane_current_command}\t#{pane_pid}"
);

/// The fixed allow-list of operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    StartServer,
    NewSession,
    KillSession,
    HasSession,
    SendKeys,
    CapturePane,
    ListSessions,
    ListWindows,
    ListPanes,
    PipePane,
    AttachSession,
}

impl OperationType {
    pub const ALL: [OperationType; 11] = [
        Self::StartServer,
        Self::NewSession,
        Self::KillSession,
        Self::HasSession,
        Self::SendKeys,
        Self::CapturePane,
        Self::ListSessions,
        Self::ListWindows,
        Self::ListPanes,
        Self::PipePane,
        Self::AttachSession,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartServer => "start-server",
            Self::NewSession => "new-session",
            Self::KillSession => "kill-session",
            Self::HasSession => "has-session",
            Self::SendKeys => "send-keys",
            Self::CapturePane => "capture-pane",
            Self::ListSessions => "list-sessions",
            Self::ListWindows => "list-windows",
            Self::ListPanes => "list-panes",
            Self::PipePane => "pipe-pane",
            Self::AttachSession => "attach-session",
        }
    }

    /// Baseline audit risk for a successful execution of this type.
    pub fn base_risk(self) -> u8 {
        match self {
            Self::ListSessions
            | Self::ListWindows
            | Self::ListPanes
            | Self::HasSession
            | Self::StartServer => 0,
            Self::CapturePane | Self::AttachSession => 1,
            Self::NewSession | Self::PipePane => 2,
            Self::SendKeys => 3,
            Self::KillSession => 4,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| MuxError::Validation(format!("operation `{s}` is not permitted")))
    }
}

/// Loosely-typed parameters supplied at the string boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationParams {
    pub session: Option<String>,
    pub target: Option<String>,
    pub window_name: Option<String>,
    pub shell: Option<String>,
    pub text: Option<String>,
    pub keys: Vec<String>,
    pub press_enter: bool,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub width: Option<u16>,
    pub height: Option<u16>,
}

/// How a user-supplied field is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Session or window name.
    Identifier,
    /// Pane/window/session target expression.
    Target,
    /// Literal text typed into a pane.
    CommandText,
    /// tmux key name (`Enter`, `C-c`, ...).
    Key,
    /// Absolute path of a shell binary.
    Shell,
}

/// A fully-specified allow-listed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxOperation {
    StartServer,
    NewSession {
        name: String,
        window_name: Option<String>,
        shell: Option<String>,
        width: Option<u16>,
        height: Option<u16>,
    },
    KillSession {
        name: String,
    },
    HasSession {
        name: String,
    },
    SendKeys {
        target: String,
        text: Option<String>,
        keys: Vec<String>,
        press_enter: bool,
    },
    CapturePane {
        target: String,
        start: Option<i64>,
        end: Option<i64>,
    },
    ListSessions,
    ListWindows {
        session: String,
    },
    /// Every pane of one session, or of all sessions when `None`.
    ListPanes {
        session: Option<String>,
    },
    /// Close any pipe attached to the pane. Opening a pipe would require a
    /// shell command and is not admitted.
    PipePane {
        target: String,
    },
    /// Read-only control-mode client streaming `%output` notifications.
    AttachSession {
        session: String,
    },
}

fn required(value: Option<String>, op: OperationType, field: &str) -> Result<String, MuxError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| MuxError::Validation(format!("{op} requires `{field}`")))
}

impl MuxOperation {
    /// Build a typed operation from an allow-listed type and loose params.
    pub fn from_params(op: OperationType, params: OperationParams) -> Result<Self, MuxError> {
        Ok(match op {
            OperationType::StartServer => Self::StartServer,
            OperationType::NewSession => Self::NewSession {
                name: required(params.session, op, "session")?,
                window_name: params.window_name,
                shell: params.shell,
                width: params.width,
                height: params.height,
            },
            OperationType::KillSession => Self::KillSession {
                name: required(params.session, op, "session")?,
            },
            OperationType::HasSession => Self::HasSession {
                name: required(params.session, op, "session")?,
            },
            OperationType::SendKeys => {
                if params.text.is_none() && params.keys.is_empty() && !params.press_enter {
                    return Err(MuxError::Validation(
                        "send-keys requires text, keys, or enter".into(),
                    ));
                }
                Self::SendKeys {
                    target: required(params.target, op, "target")?,
                    text: params.text,
                    keys: params.keys,
                    press_enter: params.press_enter,
                }
            }
            OperationType::CapturePane => Self::CapturePane {
                target: required(params.target, op, "target")?,
                start: params.start_line,
                end: params.end_line,
            },
            OperationType::ListSessions => Self::ListSessions,
            OperationType::ListWindows => Self::ListWindows {
                session: required(params.session, op, "session")?,
            },
            OperationType::ListPanes => Self::ListPanes {
                session: params.session.filter(|s| !s.trim().is_empty()),
            },
            OperationType::PipePane => Self::PipePane {
                target: required(params.target, op, "target")?,
            },
            OperationType::AttachSession => Self::AttachSession {
                session: required(params.session, op, "session")?,
            },
        })
    }

    pub fn op_type(&self) -> OperationType {
        match self {
            Self::StartServer => OperationType::StartServer,
            Self::NewSession { .. } => OperationType::NewSession,
            Self::KillSession { .. } => OperationType::KillSession,
            Self::HasSession { .. } => OperationType::HasSession,
            Self::SendKeys { .. } => OperationType::SendKeys,
            Self::CapturePane { .. } => OperationType::CapturePane,
            Self::ListSessions => OperationType::ListSessions,
            Self::ListWindows { .. } => OperationType::ListWindows,
            Self::ListPanes { .. } => OperationType::ListPanes,
            Self::PipePane { .. } => OperationType::PipePane,
            Self::AttachSession { .. } => OperationType::AttachSession,
        }
    }

    /// Every user-derived field with the rule it must satisfy.
    pub fn user_fields(&self) -> Vec<(&'static str, FieldKind, &str)> {
        let mut fields = Vec::new();
        match self {
            Self::StartServer | Self::ListSessions => {}
            Self::NewSession {
                name,
                window_name,
                shell,
                ..
            } => {
                fields.push(("session", FieldKind::Identifier, name.as_str()));
                if let Some(window) = window_name {
                    fields.push(("window_name", FieldKind::Identifier, window.as_str()));
                }
                if let Some(shell) = shell {
                    fields.push(("shell", FieldKind::Shell, shell.as_str()));
                }
            }
            Self::KillSession { name } | Self::HasSession { name } => {
                fields.push(("session", FieldKind::Identifier, name.as_str()));
            }
            Self::ListWindows { session } | Self::AttachSession { session } => {
                fields.push(("session", FieldKind::Identifier, session.as_str()));
            }
            Self::ListPanes { session } => {
                if let Some(session) = session {
                    fields.push(("session", FieldKind::Identifier, session.as_str()));
                }
            }
            Self::SendKeys {
                target, text, keys, ..
            } => {
                fields.push(("target", FieldKind::Target, target.as_str()));
                if let Some(text) = text {
                    fields.push(("text", FieldKind::CommandText, text.as_str()));
                }
                for key in keys {
                    fields.push(("key", FieldKind::Key, key.as_str()));
                }
            }
            Self::CapturePane { target, .. } | Self::PipePane { target } => {
                fields.push(("target", FieldKind::Target, target.as_str()));
            }
        }
        fields
    }

    /// Command text carried by this operation, if any (for audit metadata).
    pub fn command_text(&self) -> Option<&str> {
        match self {
            Self::SendKeys { text, .. } => text.as_deref(),
            _ => None,
        }
    }

    /// Render one or more invocations, excluding binary and socket flags.
    pub fn render(&self) -> Vec<Vec<String>> {
        let s = |v: &str| v.to_string();
        match self {
            Self::StartServer => vec![vec![s("start-server")]],
            Self::NewSession {
                name,
                window_name,
                shell,
                width,
                height,
            } => {
                let mut argv = vec![
                    s("new-session"),
                    s("-d"),
                    s("-P"),
                    s("-F"),
                    s(TREE_FORMAT),
                    s("-s"),
                    name.clone(),
                ];
                if let Some(window) = window_name {
                    argv.push(s("-n"));
                    argv.push(window.clone());
                }
                if let (Some(w), Some(h)) = (width, height) {
                    argv.push(s("-x"));
                    argv.push(w.to_string());
                    argv.push(s("-y"));
                    argv.push(h.to_string());
                }
                if let Some(shell) = shell {
                    argv.push(shell.clone());
                }
                vec![argv]
            }
            Self::KillSession { name } => vec![vec![s("kill-session"), s("-t"), exact(name)]],
            Self::HasSession { name } => vec![vec![s("has-session"), s("-t"), exact(name)]],
            Self::SendKeys {
                target,
                text,
                keys,
                press_enter,
            } => {
                let mut invocations = Vec::new();
                if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                    invocations.push(vec![
                        s("send-keys"),
                        s("-t"),
                        target.clone(),
                        s("-l"),
                        s("--"),
                        text.to_string(),
                    ]);
                }
                if !keys.is_empty() || *press_enter {
                    let mut argv = vec![s("send-keys"), s("-t"), target.clone()];
                    argv.extend(keys.iter().cloned());
                    if *press_enter {
                        argv.push(s("Enter"));
                    }
                    invocations.push(argv);
                }
                invocations
            }
            Self::CapturePane { target, start, end } => {
                let mut argv = vec![s("capture-pane"), s("-p"), s("-J"), s("-t"), target.clone()];
                if let Some(start) = start {
                    argv.push(s("-S"));
                    argv.push(start.to_string());
                }
                if let Some(end) = end {
                    argv.push(s("-E"));
                    argv.push(end.to_string());
                }
                vec![argv]
            }
            Self::ListSessions => vec![vec![s("list-sessions"), s("-F"), s(SESSION_FORMAT)]],
            Self::ListWindows { session } => vec![vec![
                s("list-windows"),
                s("-t"),
                exact(session),
                s("-F"),
                s(WINDOW_FORMAT),
            ]],
            Self::ListPanes { session } => {
                let mut argv = vec![s("list-panes")];
                match session {
                    Some(session) => {
                        argv.push(s("-s"));
                        argv.push(s("-t"));
                        argv.push(exact(session));
                    }
                    None => argv.push(s("-a")),
                }
                argv.push(s("-F"));
                argv.push(s(TREE_FORMAT));
                vec![argv]
            }
            Self::PipePane { target } => vec![vec![s("pipe-pane"), s("-t"), target.clone()]],
            Self::AttachSession { session } => vec![vec![
                s("-C"),
                s("attach-session"),
                s("-r"),
                s("-t"),
                exact(session),
            ]],
        }
    }

    /// Short human summary for audit descriptions and logs.
    pub fn summary(&self) -> String {
        match self {
            Self::StartServer | Self::ListSessions | Self::ListPanes { session: None } => {
                self.op_type().to_string()
            }
            Self::NewSession { name, .. }
            | Self::KillSession { name }
            | Self::HasSession { name } => format!("{} {name}", self.op_type()),
            Self::ListWindows { session }
            | Self::ListPanes {
                session: Some(session),
            }
            | Self::AttachSession { session } => format!("{} {session}", self.op_type()),
            Self::SendKeys { target, .. }
            | Self::CapturePane { target, .. }
            | Self::PipePane { target } => format!("{} {target}", self.op_type()),
        }
    }
}

/// Exact-match session target (`=name`), so `foo` never matches `foobar`.
pub fn exact(session: &str) -> String {
    format!("={session}")
}

/// Target addressing the active pane of a session's current window.
pub fn session_pane_target(session: &str) -> String {
    format!("={session}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_round_trips_names() {
        for op in OperationType::ALL {
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
    }

    #[test]
    fn unknown_operation_is_a_validation_error() {
        let err = "run-shell".parse::<OperationType>().unwrap_err();
        assert!(matches!(err, MuxError::Validation(_)), "got: {err:?}");
        assert!("".parse::<OperationType>().is_err());
        assert!("KILL-SESSION".parse::<OperationType>().is_err());
    }

    #[test]
    fn from_params_requires_fields() {
        let err = MuxOperation::from_params(OperationType::KillSession, OperationParams::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "validation: kill-session requires `session`");

        let err = MuxOperation::from_params(
            OperationType::SendKeys,
            OperationParams {
                target: Some("%1".into()),
                ..OperationParams::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires text"), "got: {err}");
    }

    #[test]
    fn send_keys_renders_literal_then_enter() {
        let op = MuxOperation::SendKeys {
            target: "%3".into(),
            text: Some("echo hi".into()),
            keys: Vec::new(),
            press_enter: true,
        };
        assert_eq!(
            op.render(),
            vec![
                vec!["send-keys", "-t", "%3", "-l", "--", "echo hi"],
                vec!["send-keys", "-t", "%3", "Enter"],
            ]
        );
    }

    #[test]
    fn capture_and_listing_render_expected_flags() {
        let op = MuxOperation::CapturePane {
            target: "=s1:".into(),
            start: Some(-50),
            end: None,
        };
        assert_eq!(
            op.render(),
            vec![vec!["capture-pane", "-p", "-J", "-t", "=s1:", "-S", "-50"]]
        );
        let op = MuxOperation::ListPanes {
            session: Some("s1".into()),
        };
        assert_eq!(op.render()[0][..4], ["list-panes", "-s", "-t", "=s1"]);
        let all = MuxOperation::ListPanes { session: None };
        assert_eq!(all.render(), vec![vec!["list-panes", "-a", "-F", TREE_FORMAT]]);
    }

    #[test]
    fn new_session_prints_its_listing_line() {
        let op = MuxOperation::NewSession {
            name: "work-1".into(),
            window_name: Some("main".into()),
            shell: None,
            width: Some(120),
            height: Some(40),
        };
        let argv = &op.render()[0];
        assert!(argv.contains(&"-P".to_string()));
        assert!(argv.contains(&TREE_FORMAT.to_string()));
        assert!(argv.windows(2).any(|w| w == ["-s", "work-1"]));
        assert!(argv.windows(2).any(|w| w == ["-x", "120"]));
    }

    #[test]
    fn user_fields_cover_every_free_text_value() {
        let op = MuxOperation::SendKeys {
            target: "%1".into(),
            text: Some("ls".into()),
            keys: vec!["C-c".into()],
            press_enter: false,
        };
        let kinds: Vec<FieldKind> = op.user_fields().into_iter().map(|(_, k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![FieldKind::Target, FieldKind::CommandText, FieldKind::Key]
        );
    }
}

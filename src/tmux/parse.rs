//! Parsers for tab-delimited listing output.
//!
//! Field order matches the formats in `tmux::ops`. A line with the wrong
//! field count or an unparsable numeric field is skipped, never fatal.

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub name: String,
    pub tmux_id: String,
    pub created_unix: u64,
    pub attached: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRecord {
    pub id: String,
    pub index: u32,
    pub name: String,
    pub active: bool,
}

/// One pane with its owning session and window (`TREE_FORMAT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    pub session: SessionRecord,
    pub window: WindowRecord,
    pub pane_id: String,
    pub pane_index: u32,
    pub pane_active: bool,
    pub width: u16,
    pub height: u16,
    pub command: String,
    pub pane_pid: Option<u32>,
}

fn fields(line: &str, expected: usize) -> Option<Vec<&str>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() != expected {
        debug!(expected, got = parts.len(), "skipping malformed listing line");
        return None;
    }
    Some(parts)
}

fn flag(value: &str) -> bool {
    value.trim().parse::<u32>().map(|n| n > 0).unwrap_or(false)
}

fn optional_pid(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

fn session_record(f: &[&str]) -> Option<SessionRecord> {
    if f[0].is_empty() || !f[1].starts_with('$') {
        return None;
    }
    Some(SessionRecord {
        name: f[0].to_string(),
        tmux_id: f[1].to_string(),
        created_unix: f[2].trim().parse().ok()?,
        attached: flag(f[3]),
        pid: optional_pid(f[4]),
    })
}

fn window_record(f: &[&str]) -> Option<WindowRecord> {
    if !f[0].starts_with('@') {
        return None;
    }
    Some(WindowRecord {
        id: f[0].to_string(),
        index: f[1].trim().parse().ok()?,
        name: f[2].to_string(),
        active: flag(f[3]),
    })
}

pub fn parse_sessions(text: &str) -> Vec<SessionRecord> {
    text.lines()
        .filter_map(|line| session_record(&fields(line, 5)?))
        .collect()
}

pub fn parse_windows(text: &str) -> Vec<WindowRecord> {
    let mut windows: Vec<WindowRecord> = text
        .lines()
        .filter_map(|line| window_record(&fields(line, 4)?))
        .collect();
    windows.sort_by_key(|w| w.index);
    windows
}

pub fn parse_tree(text: &str) -> Vec<TreeRow> {
    text.lines()
        .filter_map(|line| {
            let f = fields(line, 16)?;
            if !f[9].starts_with('%') {
                return None;
            }
            Some(TreeRow {
                session: session_record(&f[0..5])?,
                window: window_record(&f[5..9])?,
                pane_id: f[9].to_string(),
                pane_index: f[10].trim().parse().ok()?,
                pane_active: flag(f[11]),
                width: f[12].trim().parse().ok()?,
                height: f[13].trim().parse().ok()?,
                command: f[14].to_string(),
                pane_pid: optional_pid(f[15]),
            })
        })
        .collect()
}

/// Stderr patterns meaning no server is listening on the socket.
pub fn is_no_server_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no server running")
        || lower.contains("error connecting to")
        || lower.contains("no sessions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_skip_malformed_lines() {
        let text = "s1-1\t$0\t1700000000\t1\t4242\n\
                    garbage line\n\
                    s2-2\t$1\tnot-a-number\t0\t1\n\
                    s3-3\t$2\t1700000100\t0\t\n";
        let sessions = parse_sessions(text);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "s1-1");
        assert!(sessions[0].attached);
        assert_eq!(sessions[0].pid, Some(4242));
        assert_eq!(sessions[1].name, "s3-3");
        assert_eq!(sessions[1].pid, None);
    }

    #[test]
    fn windows_are_ordered_by_index() {
        let text = "@3\t2\tlogs\t0\n@1\t0\tmain\t1\n@2\tx\tbad\t0\n";
        let windows = parse_windows(text);
        assert_eq!(
            windows.iter().map(|w| w.index).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(windows[0].active);
    }

    #[test]
    fn tree_rows_carry_session_window_and_pane() {
        let good = "s1-1\t$0\t1700000000\t0\t77\t@1\t0\tmain\t1\t%4\t0\t1\t120\t40\tbash\t999";
        let bad_width = "s1-1\t$0\t1700000000\t0\t77\t@1\t0\tmain\t1\t%5\t1\t0\twide\t40\tvim\t1000";
        let short = "s1-1\t$0\t1700000000";
        let rows = parse_tree(&format!("{good}\n{bad_width}\n{short}\n"));
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.session.name, "s1-1");
        assert_eq!(row.window.id, "@1");
        assert_eq!(row.pane_id, "%4");
        assert_eq!((row.width, row.height), (120, 40));
        assert_eq!(row.command, "bash");
        assert_eq!(row.pane_pid, Some(999));
    }

    #[test]
    fn recognizes_missing_server_messages() {
        assert!(is_no_server_error("no server running on /tmp/x.sock"));
        assert!(is_no_server_error(
            "error connecting to /tmp/x.sock (No such file or directory)"
        ));
        assert!(!is_no_server_error("can't find session: =s1"));
    }
}

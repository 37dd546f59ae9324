//! Wire protocol to the tmux multiplexer.
//!
//! `ops` maps the operation allow-list onto argv vectors, `parse` reads the
//! tab-delimited listings back, `control` speaks the `-C` control-mode
//! framing used by pooled connections, and `output` decodes `%output`
//! notifications for continuous capture.

pub mod control;
pub mod ops;
pub mod output;
pub mod parse;

pub use control::{
    render_command_line, ControlChannel, ControlConnector, ControlReply, ReplyEvent, ReplyFramer,
    TmuxControlConnector,
};
pub use ops::{
    exact, session_pane_target, FieldKind, MuxOperation, OperationParams, OperationType,
    SESSION_FORMAT, TREE_FORMAT, WINDOW_FORMAT,
};
pub use output::{decode_octal, parse_output_line};
pub use parse::{is_no_server_error, parse_sessions, parse_tree, parse_windows};
pub use parse::{SessionRecord, TreeRow, WindowRecord};

/// Normalize a human label into a fragment tmux accepts as a session name.
///
/// tmux rewrites `.` and `:` in names, so only ASCII alphanumerics, `-` and
/// `_` survive; other runs collapse to a single `-`.
pub fn sanitize_name_fragment(raw: &str, fallback: &str) -> String {
    let mut out = String::new();
    let mut previous_dash = false;
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            previous_dash = false;
            continue;
        }
        if matches!(ch, '-' | '_') {
            if !previous_dash && !out.is_empty() {
                out.push(ch);
                previous_dash = true;
            }
            continue;
        }
        if !previous_dash && !out.is_empty() {
            out.push('-');
            previous_dash = true;
        }
    }
    let trimmed = out.trim_matches(['-', '_']).to_string();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.chars().take(48).collect()
    }
}

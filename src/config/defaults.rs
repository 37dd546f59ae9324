//! Default configuration constants.
//!
//! Callers share these constants instead of duplicating literals.

use std::path::PathBuf;

/// Embedded default `muxctl.toml` template written by `muxctl init`.
pub(super) const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../templates/muxctl.toml");
/// Multiplexer binary resolved through `PATH`.
pub(super) const DEFAULT_TMUX_BIN: &str = "tmux";
/// Per-operation deadline for multiplexer-facing calls.
pub(super) const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;
/// Reserved session pooled control-mode clients attach to.
pub(crate) const DEFAULT_CONTROL_SESSION: &str = "muxctl-control";
/// Average command latency target.
pub(super) const DEFAULT_LATENCY_TARGET_MS: u64 = 15;
/// Name the built-in tmux backend registers under.
pub(crate) const DEFAULT_BACKEND_NAME: &str = "tmux";
pub(super) const DEFAULT_LOG_FILTER: &str = "muxctl=info";
/// Config file name for local and global lookups.
pub(super) const CONFIG_FILE_NAME: &str = "muxctl.toml";

/// Control socket under the system temp directory.
pub(super) fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("muxctl").join("default.sock")
}

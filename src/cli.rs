//! CLI argument parsing via clap.

use clap::{Parser, Subcommand};
use muxctl::config::PerformanceMode;
use std::path::PathBuf;

use crate::build_info::LONG_VERSION;

/// Secure control plane for a tmux server.
#[derive(Debug, Parser)]
#[command(name = "muxctl", version, long_version = LONG_VERSION)]
pub struct Args {
    /// Path to config file (default: ./muxctl.toml or ~/.config/muxctl/muxctl.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Override the tmux control socket.
    #[arg(short = 'S', long = "socket", global = true)]
    pub socket: Option<PathBuf>,

    /// Override the performance mode (balanced, performance, reliability).
    #[arg(short = 'm', long = "mode", global = true)]
    pub mode: Option<PerformanceMode>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List sessions on the server.
    Sessions,
    /// Create a session.
    Create { name: String },
    /// Kill a session by id.
    Destroy { id: String },
    /// Type a command into a pane and press Enter.
    Send {
        session: String,
        command: String,
        #[arg(short = 'p', long = "pane")]
        pane: Option<String>,
    },
    /// Print the last lines of a pane.
    Capture {
        session: String,
        #[arg(short = 'p', long = "pane")]
        pane: Option<String>,
        #[arg(short = 'n', long = "lines", default_value_t = 50)]
        lines: usize,
    },
    /// Stream pane output until interrupted.
    Watch {
        session: String,
        #[arg(short = 'p', long = "pane")]
        pane: Option<String>,
    },
    /// Report backend health.
    Health,
    /// Print aggregate performance metrics as JSON.
    Metrics,
    /// Write the default config to ~/.config/muxctl/muxctl.toml.
    Init,
}

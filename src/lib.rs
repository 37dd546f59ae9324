//! muxctl: a secure control plane for a tmux server.
//!
//! Session lifecycle, command injection and output capture are exposed as an
//! async API. Every user-supplied string is validated before it reaches the
//! multiplexer, every decision is audited, and commands can flow either
//! straight through `tmux` invocations or through pooled control-mode
//! connections with adaptive batching.
//!
//! # Quick start
//!
//! ```no_run
//! use muxctl::config::load_config;
//! use muxctl::integration::TerminalControl;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config(None)?;
//! let control = TerminalControl::from_config(&config).await?;
//! let session = control.create_session("build").await?;
//! control.execute_command(&session.id, "make test", None).await?;
//! println!("{}", control.capture_output(&session.id, None, 20).await?);
//! control.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod integration;
pub mod logging;
pub mod performance;
pub mod security;
pub mod session;
#[cfg(test)]
pub mod testsupport;
pub mod textutil;
pub mod tmux;
pub mod transport;

//! CLI entry point for muxctl.

mod build_info;
mod cli;

use clap::Parser;
use muxctl::config::{initialize_default_global_config, load_config_with_source, GlobalConfigInitResult};
use muxctl::error::MuxError;
use muxctl::integration::TerminalControl;
use muxctl::logging::init_tracing;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::debug;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    if let cli::Command::Init = args.command {
        match initialize_default_global_config() {
            Ok(GlobalConfigInitResult::Created { path }) => {
                println!("wrote {}", path.display());
            }
            Ok(GlobalConfigInitResult::AlreadyInitialized { path }) => {
                println!("{} already exists", path.display());
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let loaded = match load_config_with_source(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    let mut config = loaded.config;
    if let Some(socket) = args.socket {
        config.tmux.socket_path = socket;
    }
    if let Some(mode) = args.mode {
        config.tmux.mode = mode;
    }
    // One-shot invocations must leave the server's sessions alone.
    config.manager.destroy_sessions_on_cleanup = false;
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    init_tracing(&config.logging);
    debug!(source = %loaded.source, "configuration loaded");

    let control = match TerminalControl::from_config(&config).await {
        Ok(control) => control,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    let result = run(&control, args.command).await;
    control.shutdown().await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(control: &TerminalControl, command: cli::Command) -> Result<(), MuxError> {
    match command {
        cli::Command::Sessions => {
            for session in control.list_sessions().await? {
                println!(
                    "{}\t{}\t{} windows{}",
                    session.id,
                    session.name,
                    session.windows.len(),
                    if session.attached { "\t(attached)" } else { "" }
                );
            }
        }
        cli::Command::Create { name } => {
            let session = control.create_session(&name).await?;
            println!("{}", session.id);
        }
        cli::Command::Destroy { id } => control.destroy_session(&id).await?,
        cli::Command::Send {
            session,
            command,
            pane,
        } => {
            let execution = control
                .execute_command(&session, &command, pane.as_deref())
                .await?;
            println!(
                "sent to {} in {:.1}ms",
                execution.pane_id.as_deref().unwrap_or(&execution.session_id),
                execution.execution_time.as_secs_f64() * 1000.0
            );
        }
        cli::Command::Capture {
            session,
            pane,
            lines,
        } => {
            let output = control
                .capture_output(&session, pane.as_deref(), lines)
                .await?;
            println!("{output}");
        }
        cli::Command::Watch { session, pane } => {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let capture = control
                .start_continuous_capture(&session, pane.as_deref(), tx)
                .await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => {
                            print!("{}", chunk.data);
                            let _ = std::io::stdout().flush();
                        }
                        None => break,
                    },
                }
            }
            control.stop_continuous_capture(&capture).await;
        }
        cli::Command::Health => {
            control.backends().run_health_checks().await;
            for status in control.health() {
                println!(
                    "{}\t{}\t{:.1}ms\t{}",
                    status.name,
                    if status.health.healthy { "healthy" } else { "unhealthy" },
                    status.health.latency.as_secs_f64() * 1000.0,
                    status
                        .health
                        .details
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
            }
        }
        cli::Command::Metrics => {
            let text = serde_json::to_string_pretty(&control.metrics())
                .map_err(|e| MuxError::Execution(format!("metrics encoding: {e}")))?;
            println!("{text}");
        }
        cli::Command::Init => {}
    }
    Ok(())
}

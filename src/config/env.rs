//! Environment overrides applied after file parsing.

use std::path::PathBuf;

use crate::error::ConfigError;

use super::Config;

pub(super) fn apply_env_overrides<FEnv>(
    config: &mut Config,
    env_lookup: &FEnv,
) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(path) = non_empty(env_lookup, "MUXCTL_SOCKET_PATH") {
        config.tmux.socket_path = PathBuf::from(path);
    }
    if let Some(bin) = non_empty(env_lookup, "MUXCTL_TMUX_BIN") {
        config.tmux.binary = bin;
    }
    if let Some(mode) = non_empty(env_lookup, "MUXCTL_MODE") {
        config.tmux.mode = mode.parse()?;
    }
    if let Some(timeout) = non_empty(env_lookup, "MUXCTL_COMMAND_TIMEOUT_MS") {
        let parsed = timeout.parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid MUXCTL_COMMAND_TIMEOUT_MS value `{timeout}`: expected positive integer milliseconds"
            ))
        })?;
        // Zero would mean every call times out immediately.
        config.tmux.command_timeout_ms = parsed.max(1);
    }
    if let Some(strategy) = non_empty(env_lookup, "MUXCTL_STRATEGY") {
        config.backend.strategy = strategy.parse()?;
    }
    Ok(())
}

fn non_empty<FEnv>(env_lookup: &FEnv, name: &str) -> Option<String>
where
    FEnv: Fn(&str) -> Option<String>,
{
    env_lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

//! Configuration loading from TOML files and environment variables.
//!
//! Config is loaded in this order of precedence (highest wins):
//! 1. Environment variables (`MUXCTL_SOCKET_PATH`, `MUXCTL_TMUX_BIN`,
//!    `MUXCTL_MODE`, `MUXCTL_COMMAND_TIMEOUT_MS`, `MUXCTL_STRATEGY`)
//! 2. TOML file specified via --config CLI flag
//! 3. ./muxctl.toml in the current directory
//! 4. $XDG_CONFIG_HOME/muxctl/muxctl.toml (or ~/.config/muxctl/muxctl.toml)
//! 5. Built-in defaults

mod defaults;
mod env;
mod init;
mod loader;
mod sources;
mod types;

pub(crate) use defaults::{DEFAULT_BACKEND_NAME, DEFAULT_CONTROL_SESSION};
pub use init::{config_root_dir, default_global_config_path, initialize_default_global_config};
pub use loader::{load_config, load_config_with_source};
pub use types::{
    BackendConfig, BatcherConfig, CacheConfig, Config, GlobalConfigInitResult, IntegrationConfig,
    LoadedConfig, LoggingConfig, ManagerConfig, PerformanceMode, PoolConfig, SecurityConfig,
    SelectionStrategy, TmuxConfig,
};

#[cfg(test)]
mod tests {
    use super::defaults::DEFAULT_CONFIG_TEMPLATE;
    use super::init::initialize_config_at_path;
    use super::loader::load_config_from_sources;
    use super::*;
    use crate::testsupport::TestTempDir;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn no_file(_: &Path) -> Result<String, std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let loaded = load_config_from_sources(None, no_file, |_| None, || None).unwrap();
        assert_eq!(loaded.source, "built-in defaults");
        let config = loaded.config;
        assert_eq!(config.tmux.binary, "tmux");
        assert_eq!(config.tmux.mode, PerformanceMode::Balanced);
        assert!(config.tmux.socket_path.is_absolute());
        assert_eq!(config.security.rate_limit_max_requests, 100);
        assert_eq!(config.backend.strategy, SelectionStrategy::PrimaryFallback);
        assert_eq!(config.backend.fallback_chain, vec!["tmux".to_string()]);
        assert_eq!(config.manager.history_limit, 1000);
    }

    #[test]
    fn explicit_path_wins_over_local_and_global() {
        let files: HashMap<PathBuf, &str> = HashMap::from([
            (PathBuf::from("/etc/custom.toml"), "[tmux]\nbinary = \"tmux-explicit\"\n"),
            (PathBuf::from("muxctl.toml"), "[tmux]\nbinary = \"tmux-local\"\n"),
        ]);
        let read = |path: &Path| {
            files
                .get(path)
                .map(|text| text.to_string())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
        };
        let loaded =
            load_config_from_sources(Some("/etc/custom.toml"), read, |_| None, || None).unwrap();
        assert_eq!(loaded.config.tmux.binary, "tmux-explicit");
        assert_eq!(loaded.source, "/etc/custom.toml");

        let loaded = load_config_from_sources(None, read, |_| None, || None).unwrap();
        assert_eq!(loaded.config.tmux.binary, "tmux-local");
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = load_config_from_sources(Some("/nope.toml"), no_file, |_| None, || None)
            .unwrap_err();
        assert!(err.to_string().starts_with("io:"), "got: {err}");
    }

    #[test]
    fn global_file_is_used_when_no_local_file() {
        let read = |path: &Path| {
            if path == Path::new("/home/u/.config/muxctl/muxctl.toml") {
                Ok("[tmux]\nmode = \"performance\"\n".to_string())
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
            }
        };
        let loaded = load_config_from_sources(None, read, |_| None, || {
            Some(PathBuf::from("/home/u/.config"))
        })
        .unwrap();
        assert_eq!(loaded.config.tmux.mode, PerformanceMode::Performance);
    }

    #[test]
    fn env_overrides_take_precedence_over_file() {
        let read = |_: &Path| {
            Ok("[tmux]\nmode = \"reliability\"\ncommand_timeout_ms = 900\n".to_string())
        };
        let env = |name: &str| match name {
            "MUXCTL_MODE" => Some("performance".to_string()),
            "MUXCTL_SOCKET_PATH" => Some("/run/muxctl/test.sock".to_string()),
            "MUXCTL_COMMAND_TIMEOUT_MS" => Some("0".to_string()),
            "MUXCTL_STRATEGY" => Some("round_robin".to_string()),
            _ => None,
        };
        let config = load_config_from_sources(None, read, env, || None)
            .unwrap()
            .config;
        assert_eq!(config.tmux.mode, PerformanceMode::Performance);
        assert_eq!(config.tmux.socket_path, PathBuf::from("/run/muxctl/test.sock"));
        assert_eq!(config.tmux.command_timeout_ms, 1);
        assert_eq!(config.backend.strategy, SelectionStrategy::RoundRobin);
    }

    #[test]
    fn invalid_env_values_are_reported() {
        let env = |name: &str| (name == "MUXCTL_COMMAND_TIMEOUT_MS").then(|| "soon".to_string());
        let err = load_config_from_sources(None, no_file, env, || None).unwrap_err();
        assert!(err.to_string().contains("MUXCTL_COMMAND_TIMEOUT_MS"), "got: {err}");

        let env = |name: &str| (name == "MUXCTL_MODE").then(|| "turbo".to_string());
        let err = load_config_from_sources(None, no_file, env, || None).unwrap_err();
        assert!(err.to_string().contains("turbo"), "got: {err}");
    }

    #[test]
    fn validate_rejects_inverted_pool_bounds() {
        let read = |_: &Path| Ok("[pool]\nmin_connections = 9\nmax_connections = 2\n".to_string());
        let err = load_config_from_sources(None, read, |_| None, || None).unwrap_err();
        assert!(err.to_string().contains("pool.min_connections"), "got: {err}");
    }

    #[test]
    fn embedded_template_parses_and_validates() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.backend.failure_threshold, 3);
        assert_eq!(config.batcher.performance_threshold_ms, 15);
    }

    #[test]
    fn init_creates_once_and_then_reports_existing() {
        let dir = TestTempDir::new("config-init");
        let path = dir.child("muxctl/muxctl.toml");
        assert_eq!(
            initialize_config_at_path(&path).unwrap(),
            GlobalConfigInitResult::Created { path: path.clone() }
        );
        assert_eq!(
            initialize_config_at_path(&path).unwrap(),
            GlobalConfigInitResult::AlreadyInitialized { path: path.clone() }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT_CONFIG_TEMPLATE);
    }

    #[test]
    fn strategy_and_mode_parse_from_strings() {
        assert_eq!(
            "least-connections".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LeastConnections
        );
        assert!("fastest".parse::<SelectionStrategy>().is_err());
        assert_eq!(
            " Reliability ".parse::<PerformanceMode>().unwrap(),
            PerformanceMode::Reliability
        );
        assert!(PerformanceMode::Performance.uses_batching());
        assert!(!PerformanceMode::Balanced.uses_batching());
        assert!(PerformanceMode::Balanced.uses_cache());
        assert!(!PerformanceMode::Reliability.uses_cache());
    }
}

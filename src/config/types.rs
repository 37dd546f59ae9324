//! Configuration data model.
//!
//! This module holds struct/enum definitions plus default values. Loader and
//! source-resolution logic lives in `config::sources` and `config::env` so
//! precedence behavior stays centralized.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::defaults::{
    default_socket_path, DEFAULT_BACKEND_NAME, DEFAULT_COMMAND_TIMEOUT_MS,
    DEFAULT_CONTROL_SESSION, DEFAULT_LATENCY_TARGET_MS, DEFAULT_LOG_FILTER, DEFAULT_TMUX_BIN,
};
use crate::error::ConfigError;

/// Execution strategy used by the session manager.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    /// Direct execution with session-metadata caching.
    #[default]
    Balanced,
    /// Pooled control-mode connections, adaptive batching and caching.
    Performance,
    /// Direct execution, every read goes to the multiplexer.
    Reliability,
}

impl PerformanceMode {
    /// Whether commands flow through the batcher and connection pool.
    pub fn uses_batching(self) -> bool {
        self == Self::Performance
    }

    /// Whether session listings are served from the metadata cache.
    pub fn uses_cache(self) -> bool {
        matches!(self, Self::Performance | Self::Balanced)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Performance => "performance",
            Self::Reliability => "reliability",
        }
    }
}

impl std::fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PerformanceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "performance" => Ok(Self::Performance),
            "reliability" => Ok(Self::Reliability),
            other => Err(ConfigError::Invalid(format!(
                "unknown performance mode `{other}`: expected balanced|performance|reliability"
            ))),
        }
    }
}

/// Backend selection strategy for the backend manager.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastConnections,
    PerformanceBased,
    HealthBased,
    WeightedRandom,
    #[default]
    PrimaryFallback,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::PerformanceBased => "performance-based",
            Self::HealthBased => "health-based",
            Self::WeightedRandom => "weighted-random",
            Self::PrimaryFallback => "primary-fallback",
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            "performance-based" => Ok(Self::PerformanceBased),
            "health-based" => Ok(Self::HealthBased),
            "weighted-random" => Ok(Self::WeightedRandom),
            "primary-fallback" => Ok(Self::PrimaryFallback),
            other => Err(ConfigError::Invalid(format!(
                "unknown backend strategy `{other}`"
            ))),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub tmux: TmuxConfig,
    pub security: SecurityConfig,
    pub pool: PoolConfig,
    pub batcher: BatcherConfig,
    pub cache: CacheConfig,
    pub backend: BackendConfig,
    pub integration: IntegrationConfig,
    pub manager: ManagerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject internally inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tmux.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("tmux.binary cannot be empty".into()));
        }
        if self.tmux.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "tmux.command_timeout_ms must be positive".into(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections must be at least 1".into(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConfigError::Invalid(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.batcher.max_batch_size == 0 || self.batcher.max_concurrent_batches == 0 {
            return Err(ConfigError::Invalid(
                "batcher.max_batch_size and batcher.max_concurrent_batches must be positive"
                    .into(),
            ));
        }
        if self.security.rate_limit_window_ms == 0 || self.security.rate_limit_max_requests == 0
        {
            return Err(ConfigError::Invalid(
                "security rate-limit window and max requests must be positive".into(),
            ));
        }
        if self.security.max_concurrent_commands == 0 {
            return Err(ConfigError::Invalid(
                "security.max_concurrent_commands must be at least 1".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be at least 1".into(),
            ));
        }
        if self
            .backend
            .fallback_chain
            .iter()
            .any(|name| name.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "backend.fallback_chain entries cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Multiplexer binary, control socket and command policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TmuxConfig {
    pub binary: String,
    pub socket_path: PathBuf,
    /// Shell started in new sessions; multiplexer default when unset.
    pub default_shell: Option<String>,
    /// Upper bound on lines returned by a single capture.
    pub capture_buffer_lines: usize,
    pub command_timeout_ms: u64,
    pub mode: PerformanceMode,
    /// Reserved session that pooled control-mode clients attach to.
    pub control_session: String,
}

impl TmuxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_TMUX_BIN.to_string(),
            socket_path: default_socket_path(),
            default_shell: None,
            capture_buffer_lines: 2000,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            mode: PerformanceMode::default(),
            control_session: DEFAULT_CONTROL_SESSION.to_string(),
        }
    }
}

/// Admission control and audit settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: usize,
    pub rate_limit_block_ms: u64,
    pub max_concurrent_commands: usize,
    pub max_command_length: usize,
    /// Optional JSON-lines audit file.
    pub audit_log_path: Option<PathBuf>,
    /// In-memory audit retention.
    pub audit_max_events: usize,
    /// Command text stored in audit metadata is truncated to this many chars.
    pub audit_command_chars: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 100,
            rate_limit_block_ms: 30_000,
            max_concurrent_commands: 10,
            max_command_length: 4096,
            audit_log_path: None,
            audit_max_events: 10_000,
            audit_command_chars: 200,
        }
    }
}

/// Persistent control-mode connection pool bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub max_idle_ms: u64,
    pub health_interval_ms: u64,
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 8,
            max_idle_ms: 300_000,
            health_interval_ms: 5_000,
        }
    }
}

/// Adaptive command batching.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub max_batch_wait_ms: u64,
    pub max_concurrent_batches: usize,
    /// Target per-command latency the adaptive window tunes against.
    pub performance_threshold_ms: u64,
    pub adaptive: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_wait_ms: 2,
            max_concurrent_batches: 4,
            performance_threshold_ms: DEFAULT_LATENCY_TARGET_MS,
            adaptive: true,
        }
    }
}

/// TTL + LRU session metadata cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub session_ttl_ms: u64,
    pub list_ttl_ms: u64,
    pub max_entries: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: 5_000,
            list_ttl_ms: 1_000,
            max_entries: 1_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

/// Backend registry, selection and failover.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub strategy: SelectionStrategy,
    /// Backend names in failover order; the first entry is the primary.
    pub fallback_chain: Vec<String>,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub health_check_interval_ms: u64,
    /// Consecutive failed health checks before a backend is marked unhealthy.
    pub failure_threshold: u32,
    pub drain_timeout_ms: u64,
    /// Relative weights for `weighted-random`; unlisted backends weigh 1.
    pub weights: BTreeMap<String, u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            fallback_chain: vec![DEFAULT_BACKEND_NAME.to_string()],
            max_retries: 2,
            retry_delay_ms: 100,
            health_check_interval_ms: 10_000,
            failure_threshold: 3,
            drain_timeout_ms: 10_000,
            weights: BTreeMap::new(),
        }
    }
}

/// External facade queueing and history.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Below this recent average latency the queue drains without delay.
    pub latency_floor_ms: u64,
    pub throttle_delay_ms: u64,
    pub history_limit: usize,
    pub queue_capacity: usize,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            latency_floor_ms: 10,
            throttle_delay_ms: 5,
            history_limit: 100,
            queue_capacity: 256,
        }
    }
}

/// Session-manager timers and metric windows.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub refresh_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub history_limit: usize,
    pub max_latency_samples: usize,
    pub latency_target_ms: u64,
    /// Kill every tracked session when the manager is cleaned up.
    pub destroy_sessions_on_cleanup: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1_000,
            metrics_interval_ms: 5_000,
            history_limit: 1_000,
            max_latency_samples: 1_000,
            latency_target_ms: DEFAULT_LATENCY_TARGET_MS,
            destroy_sessions_on_cleanup: true,
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `MUXCTL_LOG` is unset.
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            ansi: true,
        }
    }
}

/// Configuration payload plus the source it was read from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: String,
}

/// Result of explicit global config initialization (`muxctl init`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalConfigInitResult {
    Created { path: PathBuf },
    AlreadyInitialized { path: PathBuf },
}

//! Load configuration from XDG `config.toml` and project `.env`, then apply to the process
//! environment with priority: **existing env > .env > XDG**. Also resolves the
//! scheduler-level knobs (MCP bind address, poll/debounce intervals, message-length
//! threshold, retry policy, context directory) named by the orchestrator's external
//! configuration surface.

mod dotenv;
mod xdg_toml;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("xdg config path: {0}")]
    XdgPath(String),
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads config from XDG `config.toml` and optional project `.env`, then sets environment
/// variables only for keys that are **not** already set (so existing env has highest priority).
///
/// Order of precedence when a key is missing in the process environment:
/// 1. Value from project `.env` (current directory or `override_dir` if given)
/// 2. Value from `$XDG_CONFIG_HOME/<app_name>/config.toml` `[env]` table
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<String> = xdg_map.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue;
        }
        let value = dotenv_map
            .get(&key)
            .or_else(|| xdg_map.get(&key))
            .cloned();
        if let Some(v) = value {
            std::env::set_var(&key, v);
        }
    }

    Ok(())
}

/// `[scheduler]` table as it appears in `config.toml`; every field optional, env vars win.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfigFile {
    pub mcp_bind_addr: Option<String>,
    pub mcp_port: Option<u16>,
    pub poll_interval_ms: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub message_length_threshold: Option<usize>,
    pub retry_max_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub retry_backoff_multiplier: Option<f64>,
    pub retry_backoff_cap_ms: Option<u64>,
    pub context_dir: Option<PathBuf>,
}

/// Where the channel/context store persists its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextMode {
    /// In-memory only; `ChannelStore::destroy()` wipes inbox state on shutdown.
    Ephemeral,
    /// Disk-backed under `dir`; state survives workflow shutdown (spec.md §3.6/§4.7).
    Bind(PathBuf),
}

/// Fully-resolved scheduler-level configuration (spec.md §6.4), after merging
/// defaults, `config.toml` `[scheduler]`, and process environment (env wins).
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub mcp_bind_addr: String,
    pub mcp_port: u16,
    pub poll_interval: Duration,
    pub debounce_interval: Duration,
    pub message_length_threshold: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_multiplier: f64,
    pub retry_backoff_cap: Duration,
    pub context_mode: ContextMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let poll_interval_ms = 500;
        Self {
            mcp_bind_addr: "127.0.0.1".to_string(),
            mcp_port: 0,
            poll_interval: Duration::from_millis(poll_interval_ms),
            // "a small multiple of the controller poll interval" (spec.md §4.7 step 5).
            debounce_interval: Duration::from_millis(poll_interval_ms * 3),
            message_length_threshold: 2_000,
            retry_max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_multiplier: 2.0,
            retry_backoff_cap: Duration::from_secs(30),
            context_mode: ContextMode::Ephemeral,
        }
    }
}

impl SchedulerConfig {
    /// Resolves configuration for `app_name` from defaults, `config.toml` `[scheduler]`,
    /// and `CHORUS_*` environment variables (env wins over file, file wins over default).
    pub fn resolve(app_name: &str) -> Result<Self, LoadError> {
        let mut cfg = Self::default();
        if let Some(file) = xdg_toml::load_scheduler_overrides(app_name)? {
            cfg.apply_file(&file);
        }
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_file(&mut self, file: &SchedulerConfigFile) {
        if let Some(v) = &file.mcp_bind_addr {
            self.mcp_bind_addr = v.clone();
        }
        if let Some(v) = file.mcp_port {
            self.mcp_port = v;
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.debounce_ms {
            self.debounce_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.message_length_threshold {
            self.message_length_threshold = v;
        }
        if let Some(v) = file.retry_max_attempts {
            self.retry_max_attempts = v;
        }
        if let Some(v) = file.retry_backoff_ms {
            self.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = file.retry_backoff_multiplier {
            self.retry_backoff_multiplier = v;
        }
        if let Some(v) = file.retry_backoff_cap_ms {
            self.retry_backoff_cap = Duration::from_millis(v);
        }
        if let Some(v) = &file.context_dir {
            self.context_mode = ContextMode::Bind(v.clone());
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CHORUS_MCP_BIND_ADDR") {
            self.mcp_bind_addr = v;
        }
        if let Some(v) = env_u16("CHORUS_MCP_PORT") {
            self.mcp_port = v;
        }
        if let Some(v) = env_u64("CHORUS_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("CHORUS_DEBOUNCE_MS") {
            self.debounce_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_usize("CHORUS_MESSAGE_LENGTH_THRESHOLD") {
            self.message_length_threshold = v;
        }
        if let Some(v) = env_u32("CHORUS_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = v;
        }
        if let Some(v) = env_u64("CHORUS_RETRY_BACKOFF_MS") {
            self.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_f64("CHORUS_RETRY_BACKOFF_MULTIPLIER") {
            self.retry_backoff_multiplier = v;
        }
        if let Some(v) = env_u64("CHORUS_RETRY_BACKOFF_CAP_MS") {
            self.retry_backoff_cap = Duration::from_millis(v);
        }
        if let Ok(v) = std::env::var("CHORUS_CONTEXT_DIR") {
            self.context_mode = ContextMode::Bind(PathBuf::from(v));
        }
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(feature = "tracing-init")]
pub fn init_tracing(app_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let log_dir = dirs_log_dir(app_name);
    std::fs::create_dir_all(&log_dir).ok()?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, format!("{app_name}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Some(guard)
}

#[cfg(feature = "tracing-init")]
fn dirs_log_dir(app_name: &str) -> PathBuf {
    cross_xdg::BaseDirs::new()
        .map(|b| b.config_home().join(app_name).join("logs"))
        .unwrap_or_else(|_| PathBuf::from(format!(".{app_name}/logs")))
}

//! Layered TOML configuration for toolrpc.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toolrpc_client::{PoolConfig, RetrySettings, ServerConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required config key: {key}")]
    MissingKey { key: String },

    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },

    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Resolved configuration for a toolrpc run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub retry: RetrySettings,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

/// `[server]` section; every field may be supplied elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub client_name: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub connect_retry_delay_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_file: Option<PathBuf>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub pool_size: Option<usize>,
    pub request_timeout_ms: Option<u64>,
}

impl Settings {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables (`TOOLRPC_COMMAND`, `TOOLRPC_POOL_SIZE`,
    ///    `TOOLRPC_REQUEST_TIMEOUT_MS`)
    /// 3. Config file (`--config`, else `<config dir>/config.toml`)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let file = match &overrides.config_file {
            // An explicitly named file must exist and parse
            Some(path) => read_settings_file(path)?,
            None => load_settings_file(&config_dir().join("config.toml")),
        };
        Self::resolve(file, |key| std::env::var(key).ok(), overrides)
    }

    /// Merge a parsed file, an environment lookup, and CLI overrides.
    pub fn resolve<F>(
        file: SettingsFile,
        env: F,
        overrides: CliOverrides,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = file.server;

        // Resolve command: CLI > env > config file
        let command = overrides
            .command
            .or_else(|| env("TOOLRPC_COMMAND"))
            .or(section.command)
            .ok_or_else(|| ConfigError::MissingKey {
                key: "server.command (pass --exec, set TOOLRPC_COMMAND, or add it to config.toml)"
                    .into(),
            })?;

        let mut server = ServerConfig::new(command);
        server.args = if overrides.args.is_empty() {
            section.args
        } else {
            overrides.args
        };
        server.env = section.env;
        if let Some(name) = section.client_name {
            server.client_name = name;
        }
        if let Some(ms) = section.handshake_timeout_ms {
            server.handshake_timeout_ms = ms;
        }
        if let Some(n) = section.connect_attempts {
            server.connect_attempts = n;
        }
        if let Some(ms) = section.connect_retry_delay_ms {
            server.connect_retry_delay_ms = ms;
        }
        if let Some(ms) = section.shutdown_grace_ms {
            server.shutdown_grace_ms = ms;
        }

        // Resolve request timeout: CLI > env > config file > default
        let env_timeout = parse_env(&env, "TOOLRPC_REQUEST_TIMEOUT_MS")?;
        if let Some(ms) = overrides
            .request_timeout_ms
            .or(env_timeout)
            .or(section.request_timeout_ms)
        {
            server.request_timeout_ms = ms;
        }

        // Resolve pool size: CLI > env > config file > default
        let mut pool = file.pool.unwrap_or_default();
        let env_pool_size = parse_env(&env, "TOOLRPC_POOL_SIZE")?;
        if let Some(size) = overrides.pool_size.or(env_pool_size) {
            pool.pool_size = size;
        }
        if pool.pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "pool.pool_size".into(),
                value: "0".into(),
            });
        }

        Ok(Settings {
            server,
            pool,
            retry: file.retry.unwrap_or_default(),
        })
    }
}

fn parse_env<F, T>(env: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Get the toolrpc config directory path (~/.toolrpc/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLRPC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolrpc")
}

fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}

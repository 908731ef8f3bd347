//! Configuration module for the relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::ProxySettings;
use clap::Parser;
use serde::Deserialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "tcp-relay")]
#[command(author = "tcp-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A non-blocking TCP relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to accept connections on (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Address to forward connections to (e.g., backend.local:80)
    #[arg(short = 'f', long)]
    pub forward: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum connections per worker, inbound and outbound combined
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Timeout for connecting to the forward target, in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log every connection event
    #[arg(long)]
    pub trace_events: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Forward target configuration
#[derive(Debug, Deserialize)]
pub struct ForwardConfig {
    pub target: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            target: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Buffering and timeout configuration
#[derive(Debug, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            max_pending_bytes: default_max_pending_bytes(),
            idle_timeout_secs: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub trace_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            trace_events: false,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_pending_bytes() -> usize {
    1024 * 1024 // 1 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub forward: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub max_pending_bytes: usize,
    pub connect_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub log_level: String,
    pub trace_events: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let forward = cli
            .forward
            .or(toml_config.forward.target)
            .ok_or(ConfigError::MissingForward)?;

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            forward,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            buffer_size: toml_config.io.buffer_size,
            batch_size: toml_config.io.batch_size,
            max_pending_bytes: toml_config.io.max_pending_bytes,
            connect_timeout_ms: cli
                .connect_timeout_ms
                .unwrap_or(toml_config.forward.connect_timeout_ms),
            idle_timeout_secs: cli
                .idle_timeout_secs
                .unwrap_or(toml_config.io.idle_timeout_secs),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            trace_events: cli.trace_events || toml_config.logging.trace_events,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.listen)
    }

    pub fn forward_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.forward)
    }

    /// Reactor settings for one worker.
    pub fn proxy_settings(&self, reuse_port: bool) -> ProxySettings {
        ProxySettings {
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            batch_size: self.batch_size,
            max_pending_bytes: self.max_pending_bytes,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            reuse_port,
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .map_err(|e| ConfigError::InvalidAddress(addr.to_string(), e))?
        .next()
        .ok_or_else(|| {
            ConfigError::InvalidAddress(
                addr.to_string(),
                io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
            )
        })
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead { path: PathBuf, source: io::Error },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("No forward target given (use --forward or [forward] target)")]
    MissingForward,
    #[error("Invalid address '{0}': {1}")]
    InvalidAddress(String, #[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("tcp-relay").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.forward.target, None);
        assert_eq!(config.io.max_pending_bytes, 1024 * 1024);
        assert_eq!(config.io.idle_timeout_secs, 0);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4

            [forward]
            target = "127.0.0.1:6379"
            connect_timeout_ms = 2500

            [io]
            buffer_size = 8192
            idle_timeout_secs = 30

            [logging]
            level = "debug"
            trace_events = true
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.forward.target.as_deref(), Some("127.0.0.1:6379"));
        assert_eq!(config.forward.connect_timeout_ms, 2500);
        assert_eq!(config.io.buffer_size, 8192);
        assert_eq!(config.io.batch_size, 1024);
        assert_eq!(config.io.idle_timeout_secs, 30);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.trace_events);
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            [forward]
            target = "10.0.0.1:80"
            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--forward", "127.0.0.1:81", "--log-level", "debug", "-w", "2"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.forward, "127.0.0.1:81");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.workers, Some(2));
    }

    #[test]
    fn test_missing_forward() {
        let err = Config::merge(cli(&[]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingForward));
    }

    #[test]
    fn test_proxy_settings() {
        let config = Config::merge(
            cli(&["-f", "127.0.0.1:81", "--idle-timeout-secs", "5", "--connect-timeout-ms", "250"]),
            TomlConfig::default(),
        )
        .unwrap();

        let settings = config.proxy_settings(true);
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.connect_timeout, Duration::from_millis(250));
        assert!(settings.reuse_port);
        assert_eq!(config.forward_addr().unwrap(), "127.0.0.1:81".parse().unwrap());

        let settings = Config::merge(cli(&["-f", "127.0.0.1:81"]), TomlConfig::default())
            .unwrap()
            .proxy_settings(false);
        assert_eq!(settings.idle_timeout, None);
    }

    #[test]
    fn test_invalid_address() {
        let config = Config::merge(cli(&["-f", "not an address"]), TomlConfig::default()).unwrap();
        assert!(matches!(config.forward_addr(), Err(ConfigError::InvalidAddress(..))));
    }
}

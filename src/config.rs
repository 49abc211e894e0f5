//! Configuration module for the hashbench harness.
//!
//! Supports command-line arguments plus an optional TOML tuning file.
//! CLI arguments take precedence over tuning file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "hashbench")]
#[command(version = "0.1.0")]
#[command(about = "Benchmarking harness for a batched digest-echo socket service", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub role: Role,

    /// Path to TOML tuning file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

/// Process role: digest-echo server or traffic-generating client
#[derive(Subcommand, Debug)]
pub enum Role {
    /// Run the digest-echo server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: u16,

        /// Number of worker threads in the pool
        #[arg(short, long)]
        workers: usize,

        /// Number of tasks that triggers an immediate batch flush
        #[arg(short, long)]
        batch_size: usize,

        /// Maximum seconds a batched task may wait before a timer flush
        /// (fractional values allowed)
        #[arg(short = 't', long)]
        batch_time: f64,
    },
    /// Run the traffic generator
    Client {
        /// Server hostname or address
        #[arg(long)]
        host: String,

        /// Server port
        #[arg(short, long)]
        port: u16,

        /// Messages to send per second
        #[arg(short, long)]
        rate: u64,
    },
}

/// TOML tuning file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlTuning {
    #[serde(default)]
    pub tuning: TuningConfig,
}

/// Tunable wire and timing constants
#[derive(Debug, Deserialize)]
pub struct TuningConfig {
    /// Client-to-server message size in bytes
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    /// Server-to-client message size in bytes (padded digest width)
    #[serde(default = "default_digest_width")]
    pub digest_width: usize,
    /// Statistics reporting interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Delay before the first statistics report in seconds
    #[serde(default = "default_stats_delay")]
    pub stats_delay_secs: u64,
    /// Per-task read/write deadline in seconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            payload_size: default_payload_size(),
            digest_width: default_digest_width(),
            stats_interval_secs: default_stats_interval(),
            stats_delay_secs: default_stats_delay(),
            io_timeout_secs: default_io_timeout(),
        }
    }
}

fn default_payload_size() -> usize {
    8192
}

fn default_digest_width() -> usize {
    40
}

fn default_stats_interval() -> u64 {
    20
}

fn default_stats_delay() -> u64 {
    5
}

fn default_io_timeout() -> u64 {
    30
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: RoleConfig,
    pub tuning: Tuning,
    pub log_level: String,
}

/// Resolved role-specific settings
#[derive(Debug, Clone)]
pub enum RoleConfig {
    Server(ServerConfig),
    Client(ClientConfig),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    pub max_batch_size: usize,
    pub max_batch_latency: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub rate: u64,
}

/// Resolved tuning constants with durations materialized
#[derive(Debug, Clone)]
pub struct Tuning {
    pub payload_size: usize,
    pub digest_width: usize,
    pub stats_interval: Duration,
    pub stats_delay: Duration,
    pub io_timeout: Duration,
}

impl From<TuningConfig> for Tuning {
    fn from(t: TuningConfig) -> Self {
        Self {
            payload_size: t.payload_size,
            digest_width: t.digest_width,
            stats_interval: Duration::from_secs(t.stats_interval_secs),
            stats_delay: Duration::from_secs(t.stats_delay_secs),
            io_timeout: Duration::from_secs(t.io_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and the optional TOML tuning file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_tuning = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str::<TomlTuning>(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlTuning::default()
        };

        let role = match cli.role {
            Role::Server {
                port,
                workers,
                batch_size,
                batch_time,
            } => {
                if workers == 0 {
                    return Err(ConfigError::Invalid("workers must be at least 1"));
                }
                if batch_size == 0 {
                    return Err(ConfigError::Invalid("batch size must be at least 1"));
                }
                if !(batch_time > 0.0) {
                    return Err(ConfigError::Invalid("batch time must be positive"));
                }
                RoleConfig::Server(ServerConfig {
                    port,
                    workers,
                    max_batch_size: batch_size,
                    max_batch_latency: Duration::from_secs_f64(batch_time),
                })
            }
            Role::Client { host, port, rate } => {
                if rate == 0 {
                    return Err(ConfigError::Invalid("rate must be at least 1"));
                }
                RoleConfig::Client(ClientConfig { host, port, rate })
            }
        };

        Ok(Config {
            role,
            tuning: toml_tuning.tuning.into(),
            log_level: cli.log_level,
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tuning() {
        let tuning = TuningConfig::default();
        assert_eq!(tuning.payload_size, 8192);
        assert_eq!(tuning.digest_width, 40);
        assert_eq!(tuning.stats_interval_secs, 20);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [tuning]
            payload_size = 1024
            digest_width = 40
            stats_interval_secs = 10
            io_timeout_secs = 5
        "#;

        let tuning: TomlTuning = toml::from_str(toml_str).unwrap();
        assert_eq!(tuning.tuning.payload_size, 1024);
        assert_eq!(tuning.tuning.digest_width, 40);
        assert_eq!(tuning.tuning.stats_interval_secs, 10);
        assert_eq!(tuning.tuning.io_timeout_secs, 5);
        // Unspecified fields keep their defaults
        assert_eq!(tuning.tuning.stats_delay_secs, 5);
    }

    #[test]
    fn test_server_args_resolve() {
        let cli = CliArgs::parse_from([
            "hashbench",
            "server",
            "--port",
            "5000",
            "--workers",
            "12",
            "--batch-size",
            "10",
            "--batch-time",
            "2.5",
        ]);
        let config = Config::from_cli(cli).unwrap();
        match config.role {
            RoleConfig::Server(s) => {
                assert_eq!(s.port, 5000);
                assert_eq!(s.workers, 12);
                assert_eq!(s.max_batch_size, 10);
                assert_eq!(s.max_batch_latency, Duration::from_millis(2500));
            }
            RoleConfig::Client(_) => panic!("expected server role"),
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cli = CliArgs::parse_from([
            "hashbench",
            "server",
            "--port",
            "5000",
            "--workers",
            "0",
            "--batch-size",
            "10",
            "--batch-time",
            "1",
        ]);
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn test_missing_args_rejected() {
        assert!(CliArgs::try_parse_from(["hashbench", "client", "--host", "localhost"]).is_err());
    }
}

//! Configuration module for the lineward server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the line-protocol server
#[derive(Parser, Debug)]
#[command(name = "lineward")]
#[command(author = "lineward authors")]
#[command(version = "0.1.0")]
#[command(about = "A connection-oriented TCP line-protocol server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9998)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Disable reverse-DNS lookup of client addresses
    #[arg(long)]
    pub no_dns: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Reverse-DNS lookup of client addresses
    #[serde(default = "default_resolve_hostnames")]
    pub resolve_hostnames: bool,
    /// Line broadcast to connected clients when the server stops
    #[serde(default = "default_shutdown_notice")]
    pub shutdown_notice: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            resolve_hostnames: default_resolve_hostnames(),
            shutdown_notice: default_shutdown_notice(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9998".to_string()
}

fn default_resolve_hostnames() -> bool {
    true
}

fn default_shutdown_notice() -> String {
    "Server is shutting down".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub resolve_hostnames: bool,
    pub shutdown_notice: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path).map_err(|e| {
                ConfigError::FileRead {
                    path: config_path.clone(),
                    source: e,
                }
            })?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        let listen_raw = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen_raw
            .parse()
            .map_err(|_| ConfigError::BadListenAddr(listen_raw.clone()))?;

        Ok(Config {
            listen,
            resolve_hostnames: !cli.no_dns && toml_config.server.resolve_hostnames,
            shutdown_notice: toml_config.server.shutdown_notice,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid listen address '{0}'")]
    BadListenAddr(String),
}

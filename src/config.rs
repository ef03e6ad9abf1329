//! Configuration for the acceptor and HTTP layer.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, mirroring the
//! merge pattern used throughout this crate's configuration surface.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for a `corehttpd` binary.
#[derive(Parser, Debug)]
#[command(name = "corehttpd")]
#[command(about = "An embeddable HTTP/1.1 server core", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP to bind (empty binds both 0.0.0.0 and ::).
    #[arg(short = 'l', long)]
    pub ip: Option<String>,

    /// Port to bind.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Number of worker processes (0 = single-process mode).
    #[arg(short = 'w', long)]
    pub worker_processes: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub worker_processes: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_epoll_events")]
    pub max_epoll_events: usize,
    #[serde(default = "default_max_free_connection")]
    pub max_free_connection: usize,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_true")]
    pub response_date: bool,
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            worker_processes: 0,
            backlog: default_backlog(),
            max_epoll_events: default_max_epoll_events(),
            max_free_connection: default_max_free_connection(),
            keep_alive: true,
            response_date: true,
            server_name: default_server_name(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_ip() -> String {
    String::new()
}
fn default_port() -> u16 {
    8080
}
fn default_backlog() -> i32 {
    10
}
fn default_max_epoll_events() -> usize {
    256
}
fn default_max_free_connection() -> usize {
    128
}
fn default_true() -> bool {
    true
}
fn default_server_name() -> String {
    "corehttpd".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration used by `net::acceptor::Acceptor`.
#[derive(Debug, Clone)]
pub struct Config {
    pub ip: String,
    pub port: u16,
    pub worker_processes: usize,
    pub backlog: i32,
    pub max_epoll_events: usize,
    pub max_free_connection: usize,
    pub keep_alive: bool,
    pub response_date: bool,
    pub server_name: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            ip: server.ip,
            port: server.port,
            worker_processes: server.worker_processes,
            backlog: server.backlog,
            max_epoll_events: server.max_epoll_events,
            max_free_connection: server.max_free_connection,
            keep_alive: server.keep_alive,
            response_date: server.response_date,
            server_name: server.server_name,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    ///
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            ip: cli.ip.unwrap_or(toml_config.server.ip),
            port: cli.port.unwrap_or(toml_config.server.port),
            worker_processes: cli
                .worker_processes
                .unwrap_or(toml_config.server.worker_processes),
            backlog: toml_config.server.backlog,
            max_epoll_events: toml_config.server.max_epoll_events,
            max_free_connection: toml_config.server.max_free_connection,
            keep_alive: toml_config.server.keep_alive,
            response_date: toml_config.server.response_date,
            server_name: toml_config.server.server_name,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.backlog, 10);
        assert_eq!(config.max_epoll_events, 256);
        assert_eq!(config.max_free_connection, 128);
        assert!(config.keep_alive);
        assert!(config.response_date);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            ip = "0.0.0.0"
            port = 9090
            worker_processes = 4
            backlog = 128

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.ip, "0.0.0.0");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.worker_processes, 4);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs {
            config: None,
            ip: Some("127.0.0.1".to_string()),
            port: Some(1234),
            worker_processes: Some(2),
            log_level: "info".to_string(),
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.ip, "127.0.0.1");
        assert_eq!(config.port, 1234);
        assert_eq!(config.worker_processes, 2);
    }
}

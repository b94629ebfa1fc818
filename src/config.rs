//! Configuration module for the framed-kv server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Request handler served on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// get/set/del key-value commands
    Kv,
    /// Echo the request arguments back
    Echo,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "framed-kv")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded server for a length-prefixed binary protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Request handler to serve
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Request handler
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolType,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upper bound on a single readiness wait
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Idle connection timeout in seconds (0 = disabled)
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Readiness events fetched per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bytes reserved ahead of each socket read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Queued response bytes above which a connection stops reading
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            protocol: default_protocol(),
            max_connections: default_max_connections(),
            poll_timeout_ms: default_poll_timeout_ms(),
            idle_timeout_secs: 0,
            batch_size: default_batch_size(),
            read_chunk_size: default_read_chunk_size(),
            max_pending_output: default_max_pending_output(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Maximum memory usage in bytes
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
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
    "0.0.0.0:1234".to_string()
}

fn default_protocol() -> ProtocolType {
    ProtocolType::Kv
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    1024
}

fn default_read_chunk_size() -> usize {
    64 * 1024
}

fn default_max_pending_output() -> usize {
    32 * 1024 * 1024
}

fn default_max_memory() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub protocol: ProtocolType,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub batch_size: usize,
    pub read_chunk_size: usize,
    pub max_pending_output: usize,
    pub max_memory: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn resolve(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{listen}'")))?;

        let idle_timeout_secs = cli.idle_timeout.unwrap_or(file.server.idle_timeout_secs);

        let config = Config {
            listen,
            protocol: cli.protocol.unwrap_or(file.server.protocol),
            max_connections: cli
                .max_connections
                .unwrap_or(file.server.max_connections),
            poll_timeout: Duration::from_millis(file.server.poll_timeout_ms),
            idle_timeout: (idle_timeout_secs > 0).then(|| Duration::from_secs(idle_timeout_secs)),
            batch_size: file.server.batch_size,
            read_chunk_size: file.server.read_chunk_size,
            max_pending_output: file.server.max_pending_output,
            max_memory: file.storage.max_memory,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be > 0".into()));
        }
        if self.max_pending_output == 0 {
            return Err(ConfigError::Invalid("max_pending_output must be > 0".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("framed-kv").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:1234");
        assert_eq!(config.server.protocol, ProtocolType::Kv);
        assert_eq!(config.server.idle_timeout_secs, 0);
        assert_eq!(config.storage.max_memory, 64 * 1024 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            protocol = "echo"
            max_connections = 64
            idle_timeout_secs = 30
            read_chunk_size = 8192

            [storage]
            max_memory = 134217728

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.protocol, ProtocolType::Echo);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.idle_timeout_secs, 30);
        assert_eq!(config.server.read_chunk_size, 8192);
        assert_eq!(config.server.poll_timeout_ms, 1000);
        assert_eq!(config.storage.max_memory, 134217728);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            idle_timeout_secs = 30

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            cli(&["-l", "127.0.0.1:7000", "-p", "echo", "--idle-timeout", "0"]),
            file,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.protocol, ProtocolType::Echo);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_resolve_defaults() {
        let config = Config::resolve(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:1234".parse().unwrap());
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.max_pending_output, 32 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::resolve(cli(&["-l", "not-an-address"]), TomlConfig::default());
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let file: TomlConfig = toml::from_str("[server]\nread_chunk_size = 0\n").unwrap();
        assert!(matches!(
            Config::resolve(cli(&[]), file),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_output_limit_rejected() {
        // A zero high-water mark would never let a connection read or dispatch
        let file: TomlConfig = toml::from_str("[server]\nmax_pending_output = 0\n").unwrap();
        match Config::resolve(cli(&[]), file) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("max_pending_output")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}

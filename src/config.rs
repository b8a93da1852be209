//! Configuration module for the command-and-control daemon.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the daemon
#[derive(Parser, Debug, Default)]
#[command(name = "cnc-daemon")]
#[command(author = "cnc-daemon authors")]
#[command(version = "0.1.0")]
#[command(about = "Command-and-control node daemon", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// This node's address (0-31)
    #[arg(short = 'a', long)]
    pub address: Option<u8>,

    /// Service port commands are received on
    #[arg(short = 'p', long)]
    pub port: Option<u8>,

    /// Address of the peer acknowledgments are sent to
    #[arg(long)]
    pub peer: Option<u8>,

    /// Port on the peer acknowledgments are sent to
    #[arg(long)]
    pub peer_port: Option<u8>,

    /// Named pipe the peer writes frames into
    #[arg(long)]
    pub rx_pipe: Option<PathBuf>,

    /// Named pipe frames are written to
    #[arg(long)]
    pub tx_pipe: Option<PathBuf>,

    /// Link MTU in bytes
    #[arg(long)]
    pub mtu: Option<usize>,

    /// Directory plugins are loaded from
    #[arg(long)]
    pub plugin_dir: Option<PathBuf>,

    /// Accept/read/send timeout in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub buffers: BuffersConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub ack: AckConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local node configuration
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// Node address
    #[serde(default = "default_address")]
    pub address: u8,
    /// Command service port
    #[serde(default = "default_port")]
    pub port: u8,
    /// Accept/read/send timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Commanding peer configuration
#[derive(Debug, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_peer_address")]
    pub address: u8,
    #[serde(default = "default_port")]
    pub port: u8,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: default_peer_address(),
            port: default_port(),
        }
    }
}

/// Link transport configuration
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_rx_path")]
    pub rx_path: PathBuf,
    #[serde(default = "default_tx_path")]
    pub tx_path: PathBuf,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rx_path: default_rx_path(),
            tx_path: default_tx_path(),
            mtu: default_mtu(),
        }
    }
}

/// Packet buffer pool configuration
#[derive(Debug, Deserialize)]
pub struct BuffersConfig {
    #[serde(default = "default_buffer_count")]
    pub count: usize,
    #[serde(default = "default_buffer_size")]
    pub size: usize,
    /// Buffers inbound traffic may never take, kept for acknowledgments
    #[serde(default = "default_buffer_reserve")]
    pub reserve: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            count: default_buffer_count(),
            size: default_buffer_size(),
            reserve: default_buffer_reserve(),
        }
    }
}

/// Plugin configuration
#[derive(Debug, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "default_plugin_dir")]
    pub dir: PathBuf,
    /// Keep loaded plugins resident between commands
    #[serde(default = "default_retain")]
    pub retain: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
            retain: default_retain(),
        }
    }
}

/// Acknowledgment payloads
#[derive(Debug, Deserialize)]
pub struct AckConfig {
    #[serde(default = "default_ack_success")]
    pub success: String,
    #[serde(default = "default_ack_failure")]
    pub failure: String,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            success: default_ack_success(),
            failure: default_ack_failure(),
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

fn default_address() -> u8 {
    1
}

fn default_peer_address() -> u8 {
    2
}

fn default_port() -> u8 {
    10
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_rx_path() -> PathBuf {
    PathBuf::from("/tmp/cnc/client_to_server")
}

fn default_tx_path() -> PathBuf {
    PathBuf::from("/tmp/cnc/server_to_client")
}

fn default_mtu() -> usize {
    250
}

fn default_buffer_count() -> usize {
    10
}

fn default_buffer_size() -> usize {
    300
}

fn default_buffer_reserve() -> usize {
    2
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("/usr/local/lib/cnc")
}

fn default_retain() -> bool {
    true
}

fn default_ack_success() -> String {
    "Return MSG".to_string()
}

fn default_ack_failure() -> String {
    "Error MSG".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: u8,
    pub port: u8,
    pub peer_address: u8,
    pub peer_port: u8,
    pub rx_path: PathBuf,
    pub tx_path: PathBuf,
    pub mtu: usize,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub buffer_reserve: usize,
    pub plugin_dir: PathBuf,
    pub retain_plugins: bool,
    pub ack_success: String,
    pub ack_failure: String,
    pub timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already parsed CLI args.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            address: cli.address.unwrap_or(toml_config.node.address),
            port: cli.port.unwrap_or(toml_config.node.port),
            peer_address: cli.peer.unwrap_or(toml_config.peer.address),
            peer_port: cli.peer_port.unwrap_or(toml_config.peer.port),
            rx_path: cli.rx_pipe.unwrap_or(toml_config.transport.rx_path),
            tx_path: cli.tx_pipe.unwrap_or(toml_config.transport.tx_path),
            mtu: cli.mtu.unwrap_or(toml_config.transport.mtu),
            buffer_count: toml_config.buffers.count,
            buffer_size: toml_config.buffers.size,
            buffer_reserve: toml_config.buffers.reserve,
            plugin_dir: cli.plugin_dir.unwrap_or(toml_config.plugins.dir),
            retain_plugins: toml_config.plugins.retain,
            ack_success: toml_config.ack.success,
            ack_failure: toml_config.ack.failure,
            timeout: Duration::from_millis(cli.timeout_ms.unwrap_or(toml_config.node.timeout_ms)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        assert_eq!(config.address, 1);
        assert_eq!(config.port, 10);
        assert_eq!(config.peer_address, 2);
        assert_eq!(config.peer_port, 10);
        assert_eq!(config.mtu, 250);
        assert_eq!(config.buffer_count, 10);
        assert_eq!(config.buffer_size, 300);
        assert_eq!(config.buffer_reserve, 2);
        assert_eq!(config.timeout, Duration::from_millis(1000));
        assert!(config.retain_plugins);
        assert_eq!(config.ack_success, "Return MSG");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [node]
            address = 5
            timeout_ms = 250

            [peer]
            address = 7
            port = 12

            [transport]
            rx_path = "/run/cnc/in"
            tx_path = "/run/cnc/out"
            mtu = 200

            [buffers]
            count = 20
            reserve = 4

            [plugins]
            dir = "/opt/cnc/plugins"
            retain = false

            [ack]
            failure = "NACK"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.address, 5);
        assert_eq!(config.node.port, 10);
        assert_eq!(config.node.timeout_ms, 250);
        assert_eq!(config.peer.address, 7);
        assert_eq!(config.peer.port, 12);
        assert_eq!(config.transport.rx_path, PathBuf::from("/run/cnc/in"));
        assert_eq!(config.transport.mtu, 200);
        assert_eq!(config.buffers.count, 20);
        assert_eq!(config.buffers.size, 300);
        assert_eq!(config.buffers.reserve, 4);
        assert_eq!(config.plugins.dir, PathBuf::from("/opt/cnc/plugins"));
        assert!(!config.plugins.retain);
        assert_eq!(config.ack.success, "Return MSG");
        assert_eq!(config.ack.failure, "NACK");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cnc.toml");
        std::fs::write(
            &path,
            "[node]\naddress = 5\nport = 11\n\n[transport]\nmtu = 200\n",
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "cnc-daemon",
            "--config",
            path.to_str().unwrap(),
            "--address",
            "3",
            "--plugin-dir",
            "/srv/plugins",
        ]);
        let config = Config::from_args(cli).unwrap();

        assert_eq!(config.address, 3);
        assert_eq!(config.port, 11);
        assert_eq!(config.mtu, 200);
        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/cnc.toml")),
            ..Default::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(..))
        ));
    }

    #[test]
    fn test_invalid_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cnc.toml");
        std::fs::write(&path, "[node]\naddress = \"one\"\n").unwrap();

        let cli = CliArgs {
            config: Some(path),
            ..Default::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::TomlParse(..))
        ));
    }
}

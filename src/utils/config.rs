//! Configuration management for the relay chat network.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "relay-chat.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "RELAY_CHAT";

/// Complete configuration for a name server or peer process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Bootstrap registry settings
    pub name_server: NameServerConfig,
    /// Local peer identity and listeners
    pub peer: PeerConfig,
    /// Election retry behaviour
    pub election: ElectionConfig,
    /// Connection timeouts and framing
    pub network: NetworkConfig,
    /// Outbound queue retry policy
    pub delivery: DeliveryConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Name server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NameServerConfig {
    /// Host the name server listens on (and peers connect to)
    pub host: String,
    /// Well-known name server port
    pub port: u16,
    /// Where the name server persists its `chat_server` entry
    pub address_book_file: PathBuf,
    /// Seconds a granted claim may stay unconfirmed before it is released
    pub lock_timeout_secs: u64,
    /// Seconds to wait for a chat server to answer a liveness ping
    pub probe_timeout_secs: u64,
}

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Logical name published in address books
    pub name: String,
    /// Host this peer advertises and binds
    pub host: String,
    /// Port of the always-on client listener
    pub client_port: u16,
    /// Port the server-role listener binds when this peer is elected
    pub chat_server_port: u16,
    /// Seconds between address book refreshes against the chat server
    pub refresh_interval_secs: u64,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Maximum lookup/claim rounds before giving up
    pub max_attempts: u32,
    /// Base pause between rounds; a random jitter of the same size is added
    pub retry_backoff_ms: u64,
}

/// Connection layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Seconds to wait for a reply frame
    pub response_timeout_secs: u64,
    /// Maximum size of one newline-delimited frame
    pub max_frame_bytes: usize,
    /// Seconds each task gets to exit during shutdown before it is aborted
    pub shutdown_grace_secs: u64,
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts before an item is dropped; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Pause after a failed attempt in milliseconds
    pub retry_delay_ms: u64,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// User profile (name and key pair)
    pub profile_file: PathBuf,
    /// Peer address book
    pub address_book_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        let storage = StorageConfig::default();
        Self {
            name_server: NameServerConfig::with_data_dir(&storage.data_dir),
            peer: PeerConfig::default(),
            election: ElectionConfig::default(),
            network: NetworkConfig::default(),
            delivery: DeliveryConfig::default(),
            storage,
            logging: LoggingConfig::default(),
        }
    }
}

impl NameServerConfig {
    fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            host: crate::defaults::NAME_SERVER_HOST.to_string(),
            port: crate::defaults::NAME_SERVER_PORT,
            address_book_file: data_dir.join("name_server_address_book.json"),
            lock_timeout_secs: 30,
            probe_timeout_secs: 3,
        }
    }

    /// `host:port` string peers dial
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Probe timeout as a duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for NameServerConfig {
    fn default() -> Self {
        Self::with_data_dir(&StorageConfig::default().data_dir)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        let name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "peer".to_string());
        Self {
            name,
            host: "127.0.0.1".to_string(),
            client_port: crate::defaults::CLIENT_PORT,
            chat_server_port: crate::defaults::CHAT_SERVER_PORT,
            refresh_interval_secs: 30,
        }
    }
}

impl PeerConfig {
    /// Refresh interval as a duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff_ms: 200,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            response_timeout_secs: 10,
            max_frame_bytes: crate::MAX_FRAME_SIZE,
            shutdown_grace_secs: 5,
        }
    }
}

impl NetworkConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Response timeout as a duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Shutdown grace period as a duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Retry forever
            retry_delay_ms: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relay-chat");

        Self::under(data_dir)
    }
}

impl StorageConfig {
    /// Storage layout rooted at `data_dir`
    pub fn under(data_dir: PathBuf) -> Self {
        Self {
            profile_file: data_dir.join("profile.json"),
            address_book_file: data_dir.join("address_book.json"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or fails validation
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = Self::from_file(path)?;
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("relay-chat")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = Self::from_file(location)?;
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Re-root every storage path under `data_dir`
    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.name_server.address_book_file = data_dir.join("name_server_address_book.json");
        self.storage = StorageConfig::under(data_dir);
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(name) = std::env::var(format!("{ENV_PREFIX}_PEER_NAME")) {
            self.peer.name = name;
        }

        if let Ok(port) = std::env::var(format!("{ENV_PREFIX}_PEER_CLIENT_PORT")) {
            self.peer.client_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_PEER_CLIENT_PORT"),
                value: port,
            })?;
        }

        if let Ok(addr) = std::env::var(format!("{ENV_PREFIX}_NAME_SERVER_ADDR")) {
            let (host, port) = split_host_port(&addr).ok_or_else(|| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_NAME_SERVER_ADDR"),
                value: addr.clone(),
            })?;
            self.name_server.host = host;
            self.name_server.port = port;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.set_data_dir(PathBuf::from(data_dir));
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.name_server.port == 0 {
            return Err(invalid("name_server.port", "0"));
        }

        if self.name_server.host.is_empty() {
            return Err(invalid("name_server.host", ""));
        }

        // Reserved keys in every address book
        if self.peer.name.is_empty()
            || self.peer.name == crate::defaults::CHAT_SERVER_KEY
            || self.peer.name == crate::defaults::NAME_SERVER_NAME
        {
            return Err(invalid("peer.name", &self.peer.name));
        }

        if self.election.max_attempts == 0 {
            return Err(invalid("election.max_attempts", "0"));
        }

        if self.delivery.max_attempts == Some(0) {
            return Err(invalid("delivery.max_attempts", "0"));
        }

        if self.network.max_frame_bytes == 0 {
            return Err(invalid("network.max_frame_bytes", "0"));
        }

        if self.peer.refresh_interval_secs == 0 {
            return Err(invalid("peer.refresh_interval_secs", "0"));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs_to_create = vec![self.storage.data_dir.clone()];
        for file in [
            &self.storage.profile_file,
            &self.storage.address_book_file,
            &self.name_server.address_book_file,
        ] {
            if let Some(parent) = file.parent() {
                dirs_to_create.push(parent.to_path_buf());
            }
        }

        for dir in dirs_to_create.iter().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::ChatError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

/// Split `host:port`, accepting only a numeric port
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ChatConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.name_server.port, crate::defaults::NAME_SERVER_PORT);
        assert_eq!(config.name_server.address(), "127.0.0.1:8888");
        assert_eq!(config.peer.chat_server_port, 8888);
        assert!(config.delivery.max_attempts.is_none());
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = ChatConfig::default();
        config.peer.name = "alice".to_string();
        config.delivery.max_attempts = Some(7);
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = ChatConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.peer.name, "alice");
        assert_eq!(loaded.delivery.max_attempts, Some(7));
        assert_eq!(loaded.election.max_attempts, config.election.max_attempts);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[peer]\nname = \"bob\"\nclient_port = 9100\n").unwrap();

        let loaded = ChatConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.peer.name, "bob");
        assert_eq!(loaded.peer.client_port, 9100);
        assert_eq!(loaded.peer.chat_server_port, crate::defaults::CHAT_SERVER_PORT);
        assert_eq!(loaded.name_server.port, crate::defaults::NAME_SERVER_PORT);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ChatConfig::default();
        assert!(config.validate().is_ok());

        config.name_server.port = 0;
        assert!(config.validate().is_err());

        config = ChatConfig::default();
        config.peer.name = "chat_server".to_string();
        assert!(config.validate().is_err());

        config = ChatConfig::default();
        config.delivery.max_attempts = Some(0);
        assert!(config.validate().is_err());

        config = ChatConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        // Ephemeral listener ports are allowed
        config = ChatConfig::default();
        config.peer.client_port = 0;
        config.peer.chat_server_port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("RELAY_CHAT_NAME_SERVER_ADDR", "10.0.0.5:9999");

        let config = ChatConfig::default().merge_from_env().unwrap();
        assert_eq!(config.name_server.host, "10.0.0.5");
        assert_eq!(config.name_server.port, 9999);

        std::env::remove_var("RELAY_CHAT_NAME_SERVER_ADDR");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("127.0.0.1:8888"), Some(("127.0.0.1".to_string(), 8888)));
        assert_eq!(split_host_port("localhost"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("host:http"), None);
    }

    #[test]
    fn test_set_data_dir() {
        let mut config = ChatConfig::default();
        config.set_data_dir(PathBuf::from("/tmp/relay"));

        assert!(config.storage.profile_file.starts_with("/tmp/relay"));
        assert!(config.storage.address_book_file.starts_with("/tmp/relay"));
        assert!(config.name_server.address_book_file.starts_with("/tmp/relay"));
    }
}

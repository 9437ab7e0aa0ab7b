//! Configuration management for InputShare networking
//!
//! This module handles:
//! - Locating the per-user profile directory
//! - Loading and saving `config.toml`
//! - Resolving the certificate bundle path
//! - Configuration validation

use crate::error::{ConfigError, ConfigResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Default certificate bundle: PEM certificate followed by its private key
pub const DEFAULT_CERTIFICATE_FILENAME: &str = "inputshare.pem";

const DEFAULT_LISTEN_PORT: u16 = 24800;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const MAX_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_HANDSHAKE_FAILURE_DELAY_MS: u64 = 1000;
const MAX_HANDSHAKE_FAILURE_DELAY_MS: u64 = 60_000;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Network-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on
    pub listen_address: IpAddr,

    /// Port to listen on
    pub listen_port: u16,

    /// Longest time one multiplexer pass waits for socket readiness
    pub poll_interval_ms: u64,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap connections in TLS
    pub enabled: bool,

    /// Certificate bundle file name inside the profile directory
    pub certificate_filename: String,

    /// Overrides the platform profile directory
    pub profile_directory: Option<PathBuf>,

    /// Stall applied after a fatal handshake failure
    pub handshake_failure_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_LISTEN_PORT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl NetworkConfig {
    /// Socket address the listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    /// Upper bound on one multiplexer wait
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            certificate_filename: DEFAULT_CERTIFICATE_FILENAME.to_string(),
            profile_directory: None,
            handshake_failure_delay_ms: DEFAULT_HANDSHAKE_FAILURE_DELAY_MS,
        }
    }
}

impl TlsConfig {
    /// Backpressure delay after a fatal handshake classification
    pub fn handshake_failure_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_failure_delay_ms)
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Creates a ConfigManager rooted at the platform profile directory
    ///
    /// # Errors
    ///
    /// Returns error if the profile directory cannot be determined
    pub fn new() -> ConfigResult<Self> {
        Ok(Self::with_directory(Self::profile_directory()?))
    }

    /// Creates a ConfigManager rooted at an explicit directory
    pub fn with_directory(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let config_file = config_dir.join(CONFIG_FILE_NAME);
        Self {
            config_dir,
            config_file,
        }
    }

    /// Gets the per-user platform profile directory
    pub fn profile_directory() -> ConfigResult<PathBuf> {
        ProjectDirs::from("com", "inputshare", "InputShare")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::DirectoryNotFound(
                    "Could not determine profile directory".to_string(),
                )
            })
    }

    fn ensure_config_directory(&self) -> ConfigResult<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).map_err(|e| {
                ConfigError::DirectoryCreationFailed(format!(
                    "Failed to create config directory at {:?}: {}",
                    self.config_dir, e
                ))
            })?;
        }
        Ok(())
    }

    /// Loads configuration from file, or creates default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or created
    pub fn load_or_create_default(&self) -> ConfigResult<Config> {
        self.ensure_config_directory()?;

        if self.config_file.exists() {
            self.load()
        } else {
            let config = Config::default();
            self.save(&config)?;
            Ok(config)
        }
    }

    /// Loads configuration from file
    pub fn load(&self) -> ConfigResult<Config> {
        let content = fs::read_to_string(&self.config_file).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to parse config file: {}", e))
        })?;

        validate(&config)?;

        Ok(config)
    }

    /// Saves configuration to file
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid or cannot be written
    pub fn save(&self, config: &Config) -> ConfigResult<()> {
        self.ensure_config_directory()?;
        validate(config)?;

        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&self.config_file, content).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Path of the certificate bundle loaded by secure listen sockets
    ///
    /// `<profile directory>/<certificate filename>`, honouring the
    /// `tls.profile_directory` override.
    pub fn certificate_path(&self, config: &Config) -> PathBuf {
        let dir = config
            .tls
            .profile_directory
            .as_deref()
            .unwrap_or(&self.config_dir);
        dir.join(&config.tls.certificate_filename)
    }

    /// Gets the configuration directory path
    pub fn config_directory(&self) -> &Path {
        &self.config_dir
    }
}

/// Validates configuration values
pub fn validate(config: &Config) -> ConfigResult<()> {
    if config.network.poll_interval_ms == 0 || config.network.poll_interval_ms > MAX_POLL_INTERVAL_MS
    {
        return Err(ConfigError::InvalidValue(format!(
            "Poll interval must be between 1 and {} ms",
            MAX_POLL_INTERVAL_MS
        )));
    }

    let filename = Path::new(&config.tls.certificate_filename);
    if config.tls.certificate_filename.is_empty()
        || filename.file_name() != Some(filename.as_os_str())
    {
        return Err(ConfigError::InvalidValue(
            "Certificate filename must be a bare file name".to_string(),
        ));
    }

    if config.tls.handshake_failure_delay_ms > MAX_HANDSHAKE_FAILURE_DELAY_MS {
        return Err(ConfigError::InvalidValue(format!(
            "Handshake failure delay must be at most {} ms",
            MAX_HANDSHAKE_FAILURE_DELAY_MS
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_port, 24800);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.certificate_filename, "inputshare.pem");
        assert_eq!(
            config.tls.handshake_failure_delay(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.network.poll_interval_ms = 0;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.tls.certificate_filename = "../escape.pem".to_string();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.tls.certificate_filename = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(temp_dir.path());

        let mut config = manager.load_or_create_default().unwrap();
        assert!(temp_dir.path().join(CONFIG_FILE_NAME).exists());

        config.network.listen_port = 4000;
        config.tls.enabled = false;
        manager.save(&config).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.network.listen_port, 4000);
        assert!(!loaded.tls.enabled);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(temp_dir.path());
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            "[tls]\ncertificate_filename = \"custom.pem\"\n",
        )
        .unwrap();

        let config = manager.load().unwrap();
        assert_eq!(config.tls.certificate_filename, "custom.pem");
        assert_eq!(config.network.listen_port, 24800);
    }

    #[test]
    fn test_certificate_path() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(temp_dir.path());
        let mut config = Config::default();

        assert_eq!(
            manager.certificate_path(&config),
            temp_dir.path().join("inputshare.pem")
        );

        config.tls.profile_directory = Some(PathBuf::from("/srv/keys"));
        assert_eq!(
            manager.certificate_path(&config),
            PathBuf::from("/srv/keys/inputshare.pem")
        );
    }
}

//! Error types for InputShare networking
//!
//! Setup-time problems (configuration, certificates) surface as errors.
//! Steady-state TLS failures do not: they are delivered asynchronously as
//! socket events so the upstream connection manager can tear down the link.

use std::io;
use thiserror::Error;

/// Main error type for the networking layer
#[derive(Error, Debug)]
pub enum InputShareError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Certificate and key errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl InputShareError {
    /// Returns true if this is a recoverable network condition
    pub fn is_transient(&self) -> bool {
        matches!(self, InputShareError::Network(e) if e.is_transient())
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Failed to create configuration directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Certificate, private key and peer identity errors
#[derive(Error, Debug)]
pub enum CertError {
    #[error("could not use ssl certificate{}", detail(.0))]
    UseCertificate(String),

    #[error("could not use ssl private key{}", detail(.0))]
    UsePrivateKey(String),

    #[error("could not verify ssl private key{}", detail(.0))]
    VerifyPrivateKey(String),

    #[error("server has no ssl certificate")]
    MissingPeerCertificate,

    #[error("ssl context is not available{}", detail(.0))]
    ContextUnavailable(String),
}

/// Formats pending library error text as a `: <text>` suffix
fn detail(text: &str) -> String {
    if text.is_empty() {
        String::new()
    } else {
        format!(": {}", text)
    }
}

/// Network-related errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Nothing to do right now; retry on the next readiness cycle
    #[error("Network not ready: {0}")]
    Transient(io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Socket is closed")]
    Closed,

    #[error("Socket I/O error: {0}")]
    Io(io::Error),
}

impl NetworkError {
    /// Returns true for conditions the caller should simply retry later
    pub fn is_transient(&self) -> bool {
        matches!(self, NetworkError::Transient(_))
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
                NetworkError::Transient(err)
            }
            _ => NetworkError::Io(err),
        }
    }
}

impl From<toml::de::Error> for InputShareError {
    fn from(err: toml::de::Error) -> Self {
        InputShareError::Config(ConfigError::LoadFailed(err.to_string()))
    }
}

impl From<toml::ser::Error> for InputShareError {
    fn from(err: toml::ser::Error) -> Self {
        InputShareError::Config(ConfigError::SaveFailed(err.to_string()))
    }
}

/// Type alias for Results using InputShareError
pub type Result<T> = std::result::Result<T, InputShareError>;

/// Type alias for Config Results
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Type alias for certificate Results
pub type CertResult<T> = std::result::Result<T, CertError>;

/// Type alias for Network Results
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

//! Error types and handling for the relay chat network.
//!
//! Every fault in the relay layer is recoverable: connection faults make the
//! caller fall back to the next step of its algorithm, protocol faults drop
//! the offending frame, and delivery faults are retried by the outbound queue.
//! The classification helpers on [`ChatError`] let call sites pick the right
//! log level and fallback without matching on every variant.

use thiserror::Error;

/// Result type alias for the relay chat library
pub type Result<T> = std::result::Result<T, ChatError>;

/// Top-level error type for all relay chat operations
#[derive(Error, Debug, Clone)]
pub enum ChatError {
    /// Encryption capability errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connection layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Chat server election errors
    #[error("Election error: {0}")]
    Election(#[from] ElectionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence errors (address book, profile)
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the encryption capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A numeric argument or chunk is out of range for the key
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Key generation failure
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Decrypted bytes do not form the original text
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// No private key is available to open an encrypted payload
    #[error("Missing private key")]
    MissingPrivateKey,
}

/// Connection layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection refused, reset or otherwise failed at the OS level
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Binding a listener failed
    #[error("Failed to bind {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// The remote side closed the connection before replying
    #[error("Connection closed by {peer}")]
    ConnectionClosed { peer: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// No address book entry for the target
    #[error("Unknown peer: {name}")]
    UnknownPeer { name: String },
}

/// Wire protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Frame is not a valid envelope
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Command string is not part of the vocabulary
    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    /// Content does not match what the command requires
    #[error("Invalid content for '{command}': {reason}")]
    InvalidContent { command: String, reason: String },

    /// A reply carried a command the caller did not expect
    #[error("Unexpected reply '{actual}', expected {expected}")]
    UnexpectedReply { expected: String, actual: String },

    /// Frame exceeds the configured maximum
    #[error("Frame too large (max: {max} bytes)")]
    FrameTooLarge { max: usize },
}

/// Chat server election errors
#[derive(Error, Debug, Clone)]
pub enum ElectionError {
    /// Election response was neither accepted nor rejected
    #[error("Invalid election response: {response}")]
    InvalidResponse { response: String },

    /// Every attempt lost the race without discovering the winner
    #[error("Election gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The server-role listener could not be bound after privileges were granted
    #[error("Server listener unavailable after acceptance: {reason}")]
    ListenerUnavailable { reason: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Persistence errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Reading persisted state failed
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// Writing persisted state failed
    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    /// Profile has not been created yet
    #[error("No profile at {path}")]
    MissingProfile { path: String },
}

impl ChatError {
    /// Returns true for refused/reset/timed-out connections
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Network(
                NetworkError::ConnectionFailed { .. }
                    | NetworkError::ConnectionClosed { .. }
                    | NetworkError::Timeout { .. }
            ) | Self::Io(_)
        )
    }

    /// Returns true for malformed or unexpected frames
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Serialization(_))
    }

    /// Returns true if retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        self.is_connection_fault()
            || matches!(
                self,
                Self::Network(NetworkError::UnknownPeer { .. })
                    | Self::Protocol(ProtocolError::UnexpectedReply { .. })
                    | Self::Election(ElectionError::RetriesExhausted { .. })
            )
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

//! Error types for the streaming pipeline
//!
//! One top-level error with a sub-enum per layer. Capture failures are
//! normally reported as tagged results by the orchestrator; `CaptureError`
//! carries the reason across the backend boundary.

use std::io;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum StreamError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Screen capture errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Wire protocol violations
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport and connection errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Image encode/decode errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Generic(String),
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

/// Screen capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Display not found: {0}")]
    DisplayNotFound(String),

    #[error("Display enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("GPU capture is not supported on this platform")]
    GpuUnsupported,

    #[error("{context} failed with code {code:#010x}")]
    Os { context: &'static str, code: u32 },

    #[error("Duplication access lost")]
    AccessLost,

    #[error("Screen copy failed: {0}")]
    ScreenCopyFailed(String),

    #[error("Desktop switch failed: {0}")]
    DesktopSwitchFailed(String),

    #[error("Invalid capture area: {0}")]
    InvalidArea(String),
}

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message header delimiter was incorrect")]
    BadDelimiter,

    #[error("Header too short: {0} bytes")]
    ShortHeader(usize),

    #[error("Payload size {size} exceeds the limit of {max} bytes")]
    PayloadTooLarge { size: i64, max: usize },

    #[error("Negative payload size: {0}")]
    NegativePayloadSize(i32),

    #[error("Invalid payload envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Payload kind {expected:?} expected, got {actual:?}")]
    UnexpectedKind { expected: String, actual: String },
}

/// Transport and connection errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unsupported URI: {0}")]
    UnsupportedUri(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transport is not open (state: {0})")]
    NotOpen(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Image encode/decode errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode region: {0}")]
    EncodeFailed(String),

    #[error("Failed to decode region: {0}")]
    DecodeFailed(String),

    #[error("Region {0} is outside the source bitmap")]
    RegionOutOfBounds(String),

    #[error("Invalid bitmap: {0}")]
    InvalidBitmap(String),

    #[error("No surface allocated; display data has not arrived")]
    NoSurface,

    #[error("Rejected display set: {0}")]
    InvalidDisplaySet(String),
}

/// Type alias for Results using StreamError
pub type Result<T> = std::result::Result<T, StreamError>;

/// Type alias for Config Results
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Type alias for Protocol Results
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Type alias for Transport Results
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Type alias for Codec Results
pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl From<bincode::Error> for StreamError {
    fn from(err: bincode::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::InvalidEnvelope(err.to_string())
    }
}

impl From<toml::de::Error> for StreamError {
    fn from(err: toml::de::Error) -> Self {
        StreamError::Config(ConfigError::LoadFailed(err.to_string()))
    }
}

impl From<toml::ser::Error> for StreamError {
    fn from(err: toml::ser::Error) -> Self {
        StreamError::Config(ConfigError::SaveFailed(err.to_string()))
    }
}

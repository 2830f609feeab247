//! Errors surfaced by the storage engine.

use crate::config::ConfigError;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// A key or value could not be serialized.
    Codec(String),
    /// A node or value record on disk failed to decode.
    CorruptedRecord { address: u64, reason: String },
    /// The key is not stored.
    KeyNotFound,
    /// The engine has been closed.
    ClosedEngine,
    /// Internal bookkeeping disagrees with what is on disk.
    Invariant(String),
    /// Invalid configuration.
    Config(ConfigError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::CorruptedRecord { address, reason } => {
                write!(f, "corrupted record at {address}: {reason}")
            }
            Self::KeyNotFound => write!(f, "key not found"),
            Self::ClosedEngine => write!(f, "engine is closed"),
            Self::Invariant(msg) => write!(f, "invariant violated: {msg}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Codec(_)
            | Self::CorruptedRecord { .. }
            | Self::KeyNotFound
            | Self::ClosedEngine
            | Self::Invariant(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(e))
    }
}

use thiserror::Error;

/// Top-level error type for the Feedkeeper system.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for FeedkeeperError` so that `?` works across crate
/// boundaries. A duplicate message is never an error: the record store
/// reports it as a typed outcome.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FeedkeeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The durable store rejected the operation for a non-transient reason
    /// (schema mismatch, constraint failure, malformed row).
    #[error("Storage error: {0}")]
    Storage(String),

    /// The durable store could not be reached (busy, locked, I/O failure).
    /// Retryable for the single operation that hit it.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Media store error: {0}")]
    Media(String),

    #[error("Channel {channel} unreachable: {reason}")]
    ChannelUnreachable { channel: String, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl FeedkeeperError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedkeeperError::StorageUnavailable(_))
    }
}

impl From<toml::de::Error> for FeedkeeperError {
    fn from(err: toml::de::Error) -> Self {
        FeedkeeperError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for FeedkeeperError {
    fn from(err: toml::ser::Error) -> Self {
        FeedkeeperError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for FeedkeeperError {
    fn from(err: serde_json::Error) -> Self {
        FeedkeeperError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Feedkeeper operations.
pub type Result<T> = std::result::Result<T, FeedkeeperError>;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type used throughout the system.
pub type Timestamp = DateTime<Utc>;

/// Default number of media-bearing records kept per channel.
pub const DEFAULT_MEDIA_CAP: u64 = 150;

// =============================================================================
// Identifiers
// =============================================================================

/// Canonical identifier of a channel, as resolved by the channel source.
///
/// Together with the source message id it forms the natural key of a
/// [`MessageRecord`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChannelId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Which producer a message reached the pipeline through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// One-time historical scan at startup.
    Backfill,
    /// Push delivery from the live subscription.
    Live,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Backfill => f.write_str("backfill"),
            Origin::Live => f.write_str("live"),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A message as supplied by the channel source, before persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Source message id, monotonically increasing within the channel.
    pub id: i64,
    pub text: Option<String>,
    /// Arrival time assigned by the source. Drives eviction order.
    pub timestamp: Timestamp,
    pub has_media: bool,
}

/// A persisted message row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Surrogate key assigned by the storage engine.
    pub local_id: i64,
    pub channel: ChannelId,
    pub source_message_id: i64,
    pub text: Option<String>,
    pub arrival_time: Timestamp,
    /// Location of the stored media file, `None` when the message had no
    /// attachment or the download failed.
    pub media_path: Option<String>,
}

impl MessageRecord {
    /// A media-bearing record counts against the channel's retention cap.
    pub fn is_media_bearing(&self) -> bool {
        self.media_path.is_some()
    }
}

/// A message record that has not been inserted yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMessageRecord {
    pub channel: ChannelId,
    pub source_message_id: i64,
    pub text: Option<String>,
    pub arrival_time: Timestamp,
    pub media_path: Option<String>,
}

impl NewMessageRecord {
    /// Build the record for `message` received on `channel`.
    pub fn from_raw(channel: &ChannelId, message: &RawMessage, media_path: Option<String>) -> Self {
        Self {
            channel: channel.clone(),
            source_message_id: message.id,
            text: message.text.clone(),
            arrival_time: message.timestamp,
            media_path,
        }
    }
}

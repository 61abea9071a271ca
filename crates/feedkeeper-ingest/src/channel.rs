//! Channel source capability.
//!
//! The channel source owns transport and authentication to the upstream
//! message service. This crate only consumes it through [`ChannelSource`].

use std::pin::Pin;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::types::{ChannelId, RawMessage};

/// Errors reported by a channel source.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel does not exist or access to it was refused.
    #[error("Channel {channel} unreachable: {reason}")]
    Unreachable { channel: String, reason: String },
    /// The attachment of a message could not be fetched.
    #[error("Media unavailable for message {message_id}: {reason}")]
    MediaUnavailable { message_id: i64, reason: String },
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<ChannelError> for FeedkeeperError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Unreachable { channel, reason } => {
                FeedkeeperError::ChannelUnreachable { channel, reason }
            }
            other => FeedkeeperError::Channel(other.to_string()),
        }
    }
}

/// A message pushed by the live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMessage {
    pub channel: ChannelId,
    pub message: RawMessage,
}

/// Lazy, finite, non-restartable walk over a channel's history.
pub type HistoryStream = Pin<Box<dyn Stream<Item = Result<RawMessage, ChannelError>> + Send>>;

/// Upstream source of channel messages and their attachments.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Resolve a configured channel name to its canonical identity.
    async fn get_channel_identity(&self, name: &str) -> Result<ChannelId, ChannelError>;

    /// Stream the channel's history, newest message first.
    async fn iterate_history(&self, channel: &ChannelId) -> Result<HistoryStream, ChannelError>;

    /// Push every new message of `channels` into `sink` until the source
    /// disconnects or the sink is closed.
    async fn subscribe(
        &self,
        channels: &[ChannelId],
        sink: mpsc::Sender<LiveMessage>,
    ) -> Result<(), ChannelError>;

    /// Fetch the attachment of `message`.
    async fn download_media(
        &self,
        channel: &ChannelId,
        message: &RawMessage,
    ) -> Result<Vec<u8>, ChannelError>;
}

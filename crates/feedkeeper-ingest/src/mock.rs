//! Scripted channel source for tests.
//!
//! Channels, their history, live messages and failures are set up with the
//! builder methods; nothing touches the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use feedkeeper_core::types::{ChannelId, RawMessage};

use crate::channel::{ChannelError, ChannelSource, HistoryStream, LiveMessage};

#[derive(Default)]
pub struct MockChannelSource {
    history: HashMap<ChannelId, Vec<RawMessage>>,
    history_errors: HashMap<ChannelId, (usize, String)>,
    failing_downloads: HashSet<(ChannelId, i64)>,
    live: Vec<LiveMessage>,
    download_delay: Option<Duration>,
    downloads: AtomicU64,
}

impl MockChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel with its history, in any order.
    pub fn with_channel(mut self, name: &str, history: Vec<RawMessage>) -> Self {
        self.history.insert(ChannelId::new(name), history);
        self
    }

    /// Make the history walk of `channel` fail after `after` messages.
    pub fn with_history_error(mut self, channel: &str, after: usize, reason: &str) -> Self {
        self.history_errors
            .insert(ChannelId::new(channel), (after, reason.to_string()));
        self
    }

    pub fn fail_download(mut self, channel: &str, message_id: i64) -> Self {
        self.failing_downloads
            .insert((ChannelId::new(channel), message_id));
        self
    }

    /// Queue a message for the live subscription.
    pub fn with_live(mut self, channel: &str, message: RawMessage) -> Self {
        self.live.push(LiveMessage {
            channel: ChannelId::new(channel),
            message,
        });
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    /// Downloads attempted so far, failed ones included.
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    /// The bytes served as the attachment of a message.
    pub fn media_bytes(channel: &ChannelId, message_id: i64) -> Vec<u8> {
        format!("media:{}:{}", channel, message_id).into_bytes()
    }
}

#[async_trait]
impl ChannelSource for MockChannelSource {
    async fn get_channel_identity(&self, name: &str) -> Result<ChannelId, ChannelError> {
        let wanted = name.trim_start_matches('@');
        self.history
            .keys()
            .find(|id| id.as_str().eq_ignore_ascii_case(wanted))
            .cloned()
            .ok_or_else(|| ChannelError::Unreachable {
                channel: name.to_string(),
                reason: "no such channel".to_string(),
            })
    }

    async fn iterate_history(&self, channel: &ChannelId) -> Result<HistoryStream, ChannelError> {
        let mut messages = self
            .history
            .get(channel)
            .cloned()
            .ok_or_else(|| ChannelError::Unreachable {
                channel: channel.to_string(),
                reason: "no such channel".to_string(),
            })?;
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        let mut items: Vec<Result<RawMessage, ChannelError>> =
            messages.into_iter().map(Ok).collect();
        if let Some((after, reason)) = self.history_errors.get(channel) {
            items.truncate(*after);
            items.push(Err(ChannelError::Transport(reason.clone())));
        }
        Ok(Box::pin(tokio_stream::iter(items)))
    }

    async fn subscribe(
        &self,
        _channels: &[ChannelId],
        sink: mpsc::Sender<LiveMessage>,
    ) -> Result<(), ChannelError> {
        // Everything scripted is pushed, subscribed or not.
        for live in &self.live {
            if sink.send(live.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn download_media(
        &self,
        channel: &ChannelId,
        message: &RawMessage,
    ) -> Result<Vec<u8>, ChannelError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .failing_downloads
            .contains(&(channel.clone(), message.id))
        {
            return Err(ChannelError::MediaUnavailable {
                message_id: message.id,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(Self::media_bytes(channel, message.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio_stream::StreamExt;

    fn msg(id: i64, secs: i64) -> RawMessage {
        RawMessage {
            id,
            text: None,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            has_media: false,
        }
    }

    #[tokio::test]
    async fn test_identity_is_case_insensitive() {
        let source = MockChannelSource::new().with_channel("DoctorsET", Vec::new());
        let id = source.get_channel_identity("@doctorset").await.unwrap();
        assert_eq!(id.as_str(), "DoctorsET");
        assert!(matches!(
            source.get_channel_identity("missing").await,
            Err(ChannelError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let source = MockChannelSource::new()
            .with_channel("c", vec![msg(1, 10), msg(3, 30), msg(2, 20)]);
        let ids: Vec<i64> = source
            .iterate_history(&ChannelId::new("c"))
            .await
            .unwrap()
            .map(|m| m.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec![3, 2, 1]);
    }
}

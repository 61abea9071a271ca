//! Per-channel media retention.
//!
//! Keeps the number of media-bearing records of a channel at or below the
//! configured cap by evicting the oldest ones. Row deletion is authoritative
//! for the cap; a media file whose removal fails is left behind as an orphan
//! that no record references.

use std::sync::Arc;

use tracing::{info, warn};

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::types::{ChannelId, MessageRecord};

use crate::media::MediaStore;
use crate::repository::RecordStore;

/// Result of one enforcement pass.
#[derive(Debug, Clone)]
pub struct RetentionReport {
    pub channel: ChannelId,
    /// Media-bearing records counted before eviction.
    pub media_count_before: u64,
    /// Records deleted from the record store, oldest first.
    pub evicted: Vec<MessageRecord>,
    /// Media files removed (or already absent).
    pub media_deleted: usize,
    /// Media files that could not be removed.
    pub orphaned_media: usize,
}

impl RetentionReport {
    pub fn records_evicted(&self) -> usize {
        self.evicted.len()
    }
}

/// Restores the retention cap for one channel at a time.
pub struct RetentionEnforcer {
    store: Arc<dyn RecordStore>,
    media: Arc<MediaStore>,
    cap: u64,
}

impl RetentionEnforcer {
    pub fn new(store: Arc<dyn RecordStore>, media: Arc<MediaStore>, cap: u64) -> Self {
        Self { store, media, cap }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Media slots still free in the channel: `max(0, cap - count)`.
    pub fn remaining_budget(&self, channel: &ChannelId) -> Result<u64, FeedkeeperError> {
        let count = self.store.count_media_records(channel)?;
        Ok(self.cap.saturating_sub(count))
    }

    /// Evict the oldest media-bearing records above the cap, then delete
    /// their media files.
    pub async fn enforce(&self, channel: &ChannelId) -> Result<RetentionReport, FeedkeeperError> {
        let media_count_before = self.store.count_media_records(channel)?;
        let excess = media_count_before.saturating_sub(self.cap);
        if excess == 0 {
            return Ok(RetentionReport {
                channel: channel.clone(),
                media_count_before,
                evicted: Vec::new(),
                media_deleted: 0,
                orphaned_media: 0,
            });
        }

        let evicted = self.store.delete_oldest_media_records(channel, excess)?;

        let mut media_deleted = 0;
        let mut orphaned_media = 0;
        for record in &evicted {
            let Some(path) = record.media_path.as_deref() else {
                continue;
            };
            match self.media.delete(path).await {
                Ok(()) => media_deleted += 1,
                Err(e) => {
                    orphaned_media += 1;
                    warn!(
                        channel = %channel,
                        message_id = record.source_message_id,
                        error = %e,
                        "Evicted record left an orphaned media file"
                    );
                }
            }
        }

        info!(
            channel = %channel,
            cap = self.cap,
            media_count_before,
            records_evicted = evicted.len(),
            media_deleted,
            orphaned_media,
            "Retention enforced"
        );

        Ok(RetentionReport {
            channel: channel.clone(),
            media_count_before,
            evicted,
            media_deleted,
            orphaned_media,
        })
    }

    /// Run [`RetentionEnforcer::enforce`], logging failures and returning
    /// their reason instead of the error.
    ///
    /// A skipped pass is repaired by the next media-bearing insert into the
    /// channel, which triggers enforcement again.
    pub async fn enforce_or_log(&self, channel: &ChannelId) -> Result<RetentionReport, String> {
        self.enforce(channel).await.map_err(|e| {
            warn!(channel = %channel, error = %e, "Retention enforcement skipped");
            e.to_string()
        })
    }
}

//! Feedkeeper ingestion pipeline.
//!
//! The single funnel into the record store, the media store and the
//! retention enforcer. Both the backfill and the live feed hand every
//! message to [`IngestionPipeline::ingest`], which:
//! 1. short-circuits messages that are already stored
//! 2. downloads the attachment when allowed (failures are tolerated)
//! 3. inserts the record only if absent
//! 4. restores the channel's retention cap after a media-bearing insert

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::events::{EventBus, IngestEvent};
use feedkeeper_core::types::{ChannelId, NewMessageRecord, Origin, RawMessage};
use feedkeeper_storage::{MediaStore, RecordStore, RetentionEnforcer};

use crate::channel::ChannelSource;

/// A message to ingest, with the producer it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub channel: ChannelId,
    pub message: RawMessage,
    pub origin: Origin,
    /// Whether an attachment may be downloaded. Live messages always may;
    /// backfilled ones only while the channel's media budget lasts.
    pub allow_media: bool,
}

impl IngestRequest {
    pub fn live(channel: ChannelId, message: RawMessage) -> Self {
        Self {
            channel,
            message,
            origin: Origin::Live,
            allow_media: true,
        }
    }

    pub fn backfill(channel: ChannelId, message: RawMessage, allow_media: bool) -> Self {
        Self {
            channel,
            message,
            origin: Origin::Backfill,
            allow_media,
        }
    }
}

/// What happened to a message's attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    /// The message had no attachment.
    NotPresent,
    /// The attachment was not downloaded because the backfill budget ran out.
    BudgetExhausted,
    /// Download or storage failed; the record was stored without media.
    Failed(String),
    /// The attachment was stored at this path.
    Stored(String),
}

impl MediaOutcome {
    pub fn path(&self) -> Option<&str> {
        match self {
            MediaOutcome::Stored(path) => Some(path),
            _ => None,
        }
    }
}

/// Result of ingesting one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new record was created.
    Saved {
        local_id: i64,
        media: MediaOutcome,
        /// Records evicted by the retention pass that followed the insert.
        evicted: usize,
    },
    /// The message was already stored. Nothing was written.
    Duplicate,
}

impl IngestOutcome {
    /// Whether this ingestion added a media-bearing record.
    pub fn stored_media(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Saved {
                media: MediaOutcome::Stored(_),
                ..
            }
        )
    }
}

/// The ingestion pipeline. Shared by every channel worker.
pub struct IngestionPipeline {
    store: Arc<dyn RecordStore>,
    media: Arc<MediaStore>,
    retention: Arc<RetentionEnforcer>,
    source: Arc<dyn ChannelSource>,
    events: EventBus,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        media: Arc<MediaStore>,
        retention: Arc<RetentionEnforcer>,
        source: Arc<dyn ChannelSource>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            media,
            retention,
            source,
            events,
        }
    }

    pub fn retention(&self) -> &RetentionEnforcer {
        &self.retention
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Ingest one message.
    ///
    /// Only [`FeedkeeperError::StorageUnavailable`] (or another record store
    /// failure) is returned; the message is then abandoned and the caller
    /// decides whether to retry. Media failures never fail the message.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, FeedkeeperError> {
        let IngestRequest {
            channel,
            message,
            origin,
            allow_media,
        } = request;

        match self.store.contains(&channel, message.id) {
            Ok(true) => {
                self.duplicate(&channel, message.id, origin);
                return Ok(IngestOutcome::Duplicate);
            }
            Ok(false) => {}
            Err(e) => return Err(self.abandon(&channel, message.id, origin, e)),
        }

        // The record is written only after the download attempt resolved,
        // so an interrupted download never leaves a row behind.
        let media = self.fetch_media(&channel, &message, origin, allow_media).await;
        let media_path = media.path().map(str::to_string);

        let record = NewMessageRecord::from_raw(&channel, &message, media_path.clone());
        let upsert = match self.store.upsert_if_absent(&record) {
            Ok(upsert) => upsert,
            Err(e) => return Err(self.abandon(&channel, message.id, origin, e)),
        };
        let local_id = match upsert.local_id {
            Some(local_id) if upsert.created => local_id,
            _ => {
                // Lost a race with another producer. Its record stands; our
                // download (if any) wrote the same deterministic path.
                self.duplicate(&channel, message.id, origin);
                return Ok(IngestOutcome::Duplicate);
            }
        };

        info!(
            channel = %channel,
            message_id = message.id,
            origin = %origin,
            has_media = media_path.is_some(),
            "Message saved"
        );
        self.events.publish(IngestEvent::MessageSaved {
            channel: channel.clone(),
            message_id: message.id,
            origin,
            media_path: media_path.clone(),
            timestamp: Utc::now(),
        });

        let evicted = if media_path.is_some() {
            self.enforce_retention(&channel).await
        } else {
            0
        };

        Ok(IngestOutcome::Saved {
            local_id,
            media,
            evicted,
        })
    }

    /// Run a retention pass for the channel and report evictions.
    ///
    /// Failures are logged and deferred to the next media-bearing insert.
    /// Returns the number of records evicted.
    pub async fn enforce_retention(&self, channel: &ChannelId) -> usize {
        match self.retention.enforce_or_log(channel).await {
            Ok(report) => {
                for record in &report.evicted {
                    self.events.publish(IngestEvent::MediaEvicted {
                        channel: channel.clone(),
                        message_id: record.source_message_id,
                        media_path: record.media_path.clone().unwrap_or_default(),
                        timestamp: Utc::now(),
                    });
                }
                report.records_evicted()
            }
            Err(reason) => {
                self.events.publish(IngestEvent::RetentionDeferred {
                    channel: channel.clone(),
                    reason,
                    timestamp: Utc::now(),
                });
                0
            }
        }
    }

    async fn fetch_media(
        &self,
        channel: &ChannelId,
        message: &RawMessage,
        origin: Origin,
        allow_media: bool,
    ) -> MediaOutcome {
        if !message.has_media {
            return MediaOutcome::NotPresent;
        }
        if !allow_media {
            debug!(channel = %channel, message_id = message.id, "Media budget exhausted");
            self.events.publish(IngestEvent::MediaBudgetExhausted {
                channel: channel.clone(),
                message_id: message.id,
                timestamp: Utc::now(),
            });
            return MediaOutcome::BudgetExhausted;
        }

        let stored = match self.source.download_media(channel, message).await {
            Ok(bytes) => self.media.save(channel, message.id, &bytes).await,
            Err(e) => Err(FeedkeeperError::from(e)),
        };

        match stored {
            Ok(path) => MediaOutcome::Stored(path),
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    channel = %channel,
                    message_id = message.id,
                    origin = %origin,
                    error = %reason,
                    "Media download failed, recording message without media"
                );
                self.events.publish(IngestEvent::MediaDownloadFailed {
                    channel: channel.clone(),
                    message_id: message.id,
                    origin,
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                });
                MediaOutcome::Failed(reason)
            }
        }
    }

    fn duplicate(&self, channel: &ChannelId, message_id: i64, origin: Origin) {
        debug!(channel = %channel, message_id, origin = %origin, "Duplicate message skipped");
        self.events.publish(IngestEvent::DuplicateSkipped {
            channel: channel.clone(),
            message_id,
            origin,
            timestamp: Utc::now(),
        });
    }

    fn abandon(
        &self,
        channel: &ChannelId,
        message_id: i64,
        origin: Origin,
        err: FeedkeeperError,
    ) -> FeedkeeperError {
        warn!(
            channel = %channel,
            message_id,
            origin = %origin,
            error = %err,
            retryable = err.is_retryable(),
            "Message abandoned"
        );
        self.events.publish(IngestEvent::MessageAbandoned {
            channel: channel.clone(),
            message_id,
            origin,
            reason: err.to_string(),
            timestamp: Utc::now(),
        });
        err
    }
}

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{ChannelId, Origin, Timestamp};

/// Audit events emitted by the ingestion pipeline.
///
/// Every outcome of ingesting a message carries the channel, the source
/// message id and the outcome kind, so a run can be audited after the fact
/// from the event log alone. Events are consumed by:
/// - the audit log writer in the binary (JSON lines)
/// - tests asserting on pipeline behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum IngestEvent {
    // =========================================================================
    // Per-message outcomes
    // =========================================================================
    /// A new record was persisted.
    MessageSaved {
        channel: ChannelId,
        message_id: i64,
        origin: Origin,
        media_path: Option<String>,
        timestamp: Timestamp,
    },

    /// The message was already stored; nothing was written.
    DuplicateSkipped {
        channel: ChannelId,
        message_id: i64,
        origin: Origin,
        timestamp: Timestamp,
    },

    /// Downloading or storing the attachment failed. The message is still
    /// recorded, without media.
    MediaDownloadFailed {
        channel: ChannelId,
        message_id: i64,
        origin: Origin,
        reason: String,
        timestamp: Timestamp,
    },

    /// The backfill media budget for the channel was spent; the attachment
    /// was not downloaded.
    MediaBudgetExhausted {
        channel: ChannelId,
        message_id: i64,
        timestamp: Timestamp,
    },

    /// The record store could not be reached; ingestion of this message was
    /// abandoned.
    MessageAbandoned {
        channel: ChannelId,
        message_id: i64,
        origin: Origin,
        reason: String,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Retention
    // =========================================================================
    /// A media-bearing record was evicted to restore the retention cap.
    MediaEvicted {
        channel: ChannelId,
        message_id: i64,
        media_path: String,
        timestamp: Timestamp,
    },

    /// An enforcement pass could not run; the next media-bearing insert
    /// retries it.
    RetentionDeferred {
        channel: ChannelId,
        reason: String,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Channel lifecycle
    // =========================================================================
    BackfillStarted {
        run_id: Uuid,
        channel: ChannelId,
        media_budget: u64,
        timestamp: Timestamp,
    },

    BackfillCompleted {
        run_id: Uuid,
        channel: ChannelId,
        seen: u64,
        saved: u64,
        duplicates: u64,
        media_stored: u64,
        abandoned: u64,
        timestamp: Timestamp,
    },

    /// The channel could not be resolved or its history could not be read.
    /// Other channels are unaffected.
    ChannelUnreachable {
        channel: String,
        reason: String,
        timestamp: Timestamp,
    },
}

impl IngestEvent {
    /// Short name of the outcome, matching the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestEvent::MessageSaved { .. } => "message_saved",
            IngestEvent::DuplicateSkipped { .. } => "duplicate_skipped",
            IngestEvent::MediaDownloadFailed { .. } => "media_download_failed",
            IngestEvent::MediaBudgetExhausted { .. } => "media_budget_exhausted",
            IngestEvent::MessageAbandoned { .. } => "message_abandoned",
            IngestEvent::MediaEvicted { .. } => "media_evicted",
            IngestEvent::RetentionDeferred { .. } => "retention_deferred",
            IngestEvent::BackfillStarted { .. } => "backfill_started",
            IngestEvent::BackfillCompleted { .. } => "backfill_completed",
            IngestEvent::ChannelUnreachable { .. } => "channel_unreachable",
        }
    }

    /// Source message id the event refers to, if it is a per-message event.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            IngestEvent::MessageSaved { message_id, .. }
            | IngestEvent::DuplicateSkipped { message_id, .. }
            | IngestEvent::MediaDownloadFailed { message_id, .. }
            | IngestEvent::MediaBudgetExhausted { message_id, .. }
            | IngestEvent::MessageAbandoned { message_id, .. }
            | IngestEvent::MediaEvicted { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// Fan-out of [`IngestEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `Lagged` rather than stalling the
/// pipeline.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = IngestEvent::DuplicateSkipped {
            channel: ChannelId::new("yetenaweg"),
            message_id: 12,
            origin: Origin::Live,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "duplicate_skipped");
        assert_eq!(value["channel"], "yetenaweg");
        assert_eq!(value["message_id"], 12);
        assert_eq!(value["origin"], "live");
        assert_eq!(event.kind(), "duplicate_skipped");
    }

    #[test]
    fn test_message_id_only_for_message_events() {
        let saved = IngestEvent::MessageSaved {
            channel: ChannelId::new("c"),
            message_id: 3,
            origin: Origin::Backfill,
            media_path: None,
            timestamp: Utc::now(),
        };
        assert_eq!(saved.message_id(), Some(3));

        let unreachable = IngestEvent::ChannelUnreachable {
            channel: "c".into(),
            reason: "gone".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(unreachable.message_id(), None);
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(IngestEvent::RetentionDeferred {
            channel: ChannelId::new("c"),
            reason: "locked".into(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "retention_deferred");
    }

    #[test]
    fn test_event_bus_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(IngestEvent::ChannelUnreachable {
            channel: "c".into(),
            reason: "gone".into(),
            timestamp: Utc::now(),
        });
    }
}

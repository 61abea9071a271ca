//! Record store: durable message rows keyed by (channel, source message id).
//!
//! `RecordStore` is the seam the ingestion pipeline and the retention
//! enforcer are written against; `MessageRepository` is the SQLite
//! implementation operating on the shared [`Database`].

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::types::{ChannelId, MessageRecord, NewMessageRecord};

use crate::db::{sqlite_error, Database};

/// Largest page returned by [`RecordStore::list_messages`].
pub const MAX_PAGE_SIZE: u64 = 500;

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// `false` when a record for the same (channel, source message id)
    /// already existed. Nothing was mutated in that case.
    pub created: bool,
    /// Surrogate id of the new row, when one was created.
    pub local_id: Option<i64>,
}

impl UpsertOutcome {
    pub fn created(local_id: i64) -> Self {
        Self {
            created: true,
            local_id: Some(local_id),
        }
    }

    pub fn duplicate() -> Self {
        Self {
            created: false,
            local_id: None,
        }
    }
}

/// Durable table of message records.
///
/// Every method may fail with [`FeedkeeperError::StorageUnavailable`] when
/// the underlying store cannot be reached; callers treat that as retryable
/// for the single operation.
pub trait RecordStore: Send + Sync {
    /// Insert `record` unless one already exists for its (channel, source
    /// message id). Safe to call concurrently with the same key: exactly one
    /// caller observes `created = true`.
    fn upsert_if_absent(&self, record: &NewMessageRecord) -> Result<UpsertOutcome, FeedkeeperError>;

    /// Whether a record exists for the key.
    fn contains(&self, channel: &ChannelId, source_message_id: i64) -> Result<bool, FeedkeeperError>;

    /// Fetch the record for the key.
    fn find(
        &self,
        channel: &ChannelId,
        source_message_id: i64,
    ) -> Result<Option<MessageRecord>, FeedkeeperError>;

    /// Number of records in the channel with a non-null media reference.
    fn count_media_records(&self, channel: &ChannelId) -> Result<u64, FeedkeeperError>;

    /// Delete the `count` media-bearing records of the channel with the
    /// smallest arrival time (ties broken by smaller source message id) and
    /// return them. Deletes all of them when fewer than `count` exist.
    fn delete_oldest_media_records(
        &self,
        channel: &ChannelId,
        count: u64,
    ) -> Result<Vec<MessageRecord>, FeedkeeperError>;

    /// A page of the channel's records, newest first.
    fn list_messages(
        &self,
        channel: &ChannelId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<MessageRecord>, FeedkeeperError>;
}

/// SQLite-backed [`RecordStore`].
pub struct MessageRepository {
    db: Arc<Database>,
}

impl MessageRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Total records in the channel, with or without media.
    pub fn count(&self, channel: &ChannelId) -> Result<u64, FeedkeeperError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages WHERE channel = ?1",
                    rusqlite::params![channel.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| sqlite_error("Failed to count messages", e))?;
            Ok(count as u64)
        })
    }
}

const RECORD_COLUMNS: &str =
    "id, channel, source_message_id, text, arrival_time, media_path";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let arrival_secs: i64 = row.get(4)?;
    let arrival_time = Utc
        .timestamp_opt(arrival_secs, 0)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, arrival_secs))?;
    Ok(MessageRecord {
        local_id: row.get(0)?,
        channel: ChannelId::new(row.get::<_, String>(1)?),
        source_message_id: row.get(2)?,
        text: row.get(3)?,
        arrival_time,
        media_path: row.get(5)?,
    })
}

impl RecordStore for MessageRepository {
    fn upsert_if_absent(&self, record: &NewMessageRecord) -> Result<UpsertOutcome, FeedkeeperError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| sqlite_error("Failed to begin insert", e))?;

            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM messages WHERE channel = ?1 AND source_message_id = ?2)",
                    rusqlite::params![record.channel.as_str(), record.source_message_id],
                    |row| row.get(0),
                )
                .map_err(|e| sqlite_error("Failed to check for existing message", e))?;
            if exists {
                return Ok(UpsertOutcome::duplicate());
            }

            // The unique constraint stays the final word if another
            // connection to the same file inserted in between.
            let inserted = tx
                .execute(
                    "INSERT INTO messages (source_message_id, channel, text, arrival_time, media_path)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (channel, source_message_id) DO NOTHING",
                    rusqlite::params![
                        record.source_message_id,
                        record.channel.as_str(),
                        record.text,
                        record.arrival_time.timestamp(),
                        record.media_path,
                    ],
                )
                .map_err(|e| sqlite_error("Failed to save message", e))?;
            let local_id = tx.last_insert_rowid();

            tx.commit()
                .map_err(|e| sqlite_error("Failed to commit message", e))?;

            if inserted == 1 {
                Ok(UpsertOutcome::created(local_id))
            } else {
                Ok(UpsertOutcome::duplicate())
            }
        })
    }

    fn contains(&self, channel: &ChannelId, source_message_id: i64) -> Result<bool, FeedkeeperError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE channel = ?1 AND source_message_id = ?2)",
                rusqlite::params![channel.as_str(), source_message_id],
                |row| row.get(0),
            )
            .map_err(|e| sqlite_error("Failed to check for existing message", e))
        })
    }

    fn find(
        &self,
        channel: &ChannelId,
        source_message_id: i64,
    ) -> Result<Option<MessageRecord>, FeedkeeperError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM messages WHERE channel = ?1 AND source_message_id = ?2",
                    RECORD_COLUMNS
                ),
                rusqlite::params![channel.as_str(), source_message_id],
                row_to_record,
            )
            .optional()
            .map_err(|e| sqlite_error("Failed to load message", e))
        })
    }

    fn count_media_records(&self, channel: &ChannelId) -> Result<u64, FeedkeeperError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages WHERE channel = ?1 AND media_path IS NOT NULL",
                    rusqlite::params![channel.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| sqlite_error("Failed to count media records", e))?;
            Ok(count as u64)
        })
    }

    fn delete_oldest_media_records(
        &self,
        channel: &ChannelId,
        count: u64,
    ) -> Result<Vec<MessageRecord>, FeedkeeperError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| sqlite_error("Failed to begin eviction", e))?;

            let victims = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {} FROM messages
                         WHERE channel = ?1 AND media_path IS NOT NULL
                         ORDER BY arrival_time ASC, source_message_id ASC
                         LIMIT ?2",
                        RECORD_COLUMNS
                    ))
                    .map_err(|e| sqlite_error("Failed to prepare eviction query", e))?;
                let rows = stmt
                    .query_map(rusqlite::params![channel.as_str(), count], row_to_record)
                    .map_err(|e| sqlite_error("Failed to select eviction candidates", e))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| sqlite_error("Failed to read eviction candidates", e))?
            };

            {
                let mut delete = tx
                    .prepare("DELETE FROM messages WHERE id = ?1")
                    .map_err(|e| sqlite_error("Failed to prepare eviction", e))?;
                for record in &victims {
                    delete
                        .execute(rusqlite::params![record.local_id])
                        .map_err(|e| sqlite_error("Failed to evict message", e))?;
                }
            }

            tx.commit()
                .map_err(|e| sqlite_error("Failed to commit eviction", e))?;
            Ok(victims)
        })
    }

    fn list_messages(
        &self,
        channel: &ChannelId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<MessageRecord>, FeedkeeperError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM messages
                     WHERE channel = ?1
                     ORDER BY arrival_time DESC, source_message_id DESC
                     LIMIT ?2 OFFSET ?3",
                    RECORD_COLUMNS
                ))
                .map_err(|e| sqlite_error("Failed to prepare message listing", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![channel.as_str(), limit, offset],
                    row_to_record,
                )
                .map_err(|e| sqlite_error("Failed to list messages", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| sqlite_error("Failed to read messages", e))
        })
    }
}

//! Database schema migrations.
//!
//! Applies the messages table and the schema_migrations tracking table.

use rusqlite::Connection;
use tracing::info;

use feedkeeper_core::error::FeedkeeperError;

use crate::db::sqlite_error;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), FeedkeeperError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| sqlite_error("Failed to create migrations table", e))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| sqlite_error("Failed to query migration version", e))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: messages");
    }

    Ok(())
}

/// Version 1: messages keyed by (channel, source_message_id).
fn apply_v1(conn: &Connection) -> Result<(), FeedkeeperError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            source_message_id   INTEGER NOT NULL,
            channel             TEXT NOT NULL,
            text                TEXT,
            arrival_time        INTEGER NOT NULL,
            media_path          TEXT,
            created_at          INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            UNIQUE (channel, source_message_id)
        );

        -- Counting and oldest-first eviction of media-bearing rows.
        CREATE INDEX IF NOT EXISTS idx_messages_media_age
            ON messages (channel, arrival_time ASC, source_message_id ASC)
            WHERE media_path IS NOT NULL;

        -- Paginated reads, newest first.
        CREATE INDEX IF NOT EXISTS idx_messages_channel_arrival
            ON messages (channel, arrival_time DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'messages');
        ",
    )
    .map_err(|e| sqlite_error("Failed to apply migration v1", e))?;

    Ok(())
}

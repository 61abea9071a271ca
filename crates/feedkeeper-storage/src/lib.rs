//! Feedkeeper storage crate - SQLite record store, media files, retention.
//!
//! Provides a WAL-mode SQLite database with migrations, the record store
//! keyed by (channel, source message id), the per-channel media store and
//! the retention enforcer that keeps media-bearing records under the cap.

pub mod db;
pub mod media;
pub mod migrations;
pub mod repository;
pub mod retention;

pub use db::Database;
pub use media::MediaStore;
pub use repository::{MessageRepository, RecordStore, UpsertOutcome, MAX_PAGE_SIZE};
pub use retention::{RetentionEnforcer, RetentionReport};

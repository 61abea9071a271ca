//! Feedkeeper core crate - configuration, error taxonomy, domain types and
//! audit events shared by the storage and ingestion crates.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::FeedkeeperConfig;
pub use error::{FeedkeeperError, Result};
pub use events::{EventBus, IngestEvent};
pub use types::*;

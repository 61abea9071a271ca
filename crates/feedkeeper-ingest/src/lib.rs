//! Ingestion for Feedkeeper.
//!
//! Pulls messages from a [`ChannelSource`], funnels the history backfill and
//! the live feed of each channel through one worker, and persists every
//! message at most once while keeping the channel's media under its cap.

pub mod backfill;
pub mod channel;
pub mod live;
pub mod mock;
pub mod pipeline;
pub mod replay;
pub mod service;
pub mod shutdown;
pub mod worker;

pub use backfill::{BackfillCoordinator, BackfillOptions, BackfillReport};
pub use channel::{ChannelError, ChannelSource, HistoryStream, LiveMessage};
pub use live::{LiveDispatcher, LiveReport};
pub use mock::MockChannelSource;
pub use pipeline::{IngestOutcome, IngestRequest, IngestionPipeline, MediaOutcome};
pub use replay::ReplayChannelSource;
pub use service::{IngestService, ServiceOptions, ServiceReport};
pub use shutdown::shutdown_channel;
pub use worker::{spawn_worker, ChannelHandle, WorkerStats};

//! Feedkeeper application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Open storage (SQLite record store + media directory)
//! 3. Build the ingestion pipeline (dedup -> media -> store -> retention)
//! 4. Resolve the configured channels and run backfill + live ingestion
//!    until the live feed ends or Ctrl-C is pressed

mod audit;
mod cli;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use feedkeeper_core::config::{expand_home, FeedkeeperConfig};
use feedkeeper_core::events::EventBus;
use feedkeeper_core::types::ChannelId;
use feedkeeper_ingest::{
    shutdown_channel, ChannelSource, IngestService, IngestionPipeline, ReplayChannelSource,
    ServiceOptions,
};
use feedkeeper_storage::{Database, MediaStore, MessageRepository, RecordStore, RetentionEnforcer};

use audit::audit_writer;
use cli::CliArgs;

fn load_config(path: &Path) -> Result<FeedkeeperConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(FeedkeeperConfig::load(path)?)
    } else {
        Ok(FeedkeeperConfig::default())
    }
}

/// Print a page of stored records as JSON lines.
fn list_messages(
    repo: &MessageRepository,
    channel: &str,
    offset: u64,
    limit: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = repo.list_messages(&ChannelId::new(channel), offset, limit)?;
    for record in records {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = load_config(&config_file)?;
    args.apply(&mut config);

    // Tracing. RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Feedkeeper v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), exists = config_file.exists(), "Configuration resolved");
    config.validate()?;

    // Storage.
    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let db_path = config.database_path();
    let db = match Database::new(&db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(path = %db_path.display(), error = %e, "Record store unavailable");
            return Err(e.into());
        }
    };
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let repo = Arc::new(MessageRepository::new(Arc::clone(&db)));

    if let Some(ref channel) = args.list {
        return list_messages(&repo, channel, args.offset, args.limit);
    }

    let media_root = config.media_root();
    let media = Arc::new(MediaStore::new(&media_root, &config.storage.media_extension));
    tracing::info!(path = %media_root.display(), "Media store ready");

    let retention = Arc::new(RetentionEnforcer::new(
        repo.clone(),
        Arc::clone(&media),
        config.retention.media_cap,
    ));

    // Channel source.
    let Some(replay_dir) = args.replay_dir.clone() else {
        tracing::error!("No channel source configured; pass --replay-dir");
        return Err("missing --replay-dir".into());
    };
    let mut replay = ReplayChannelSource::new(&replay_dir);
    if args.live_stdin {
        replay = replay.with_live_input(tokio::io::BufReader::new(tokio::io::stdin()));
    }
    let source: Arc<dyn ChannelSource> = Arc::new(replay);
    tracing::info!(path = %replay_dir.display(), live_stdin = args.live_stdin, "Replaying channel exports");

    // Events and audit log.
    let events = EventBus::default();
    let audit_task = config.general.audit_log.as_deref().map(|path| {
        let path = expand_home(path);
        tokio::spawn(audit_writer(path, events.subscribe()))
    });

    // Ingestion.
    let pipeline = Arc::new(IngestionPipeline::new(
        repo.clone(),
        media,
        retention,
        Arc::clone(&source),
        events.clone(),
    ));
    tracing::info!(
        media_cap = config.retention.media_cap,
        "Ingestion pipeline ready (dedup -> media -> store -> retention)"
    );

    if config.channels.names.is_empty() {
        tracing::warn!("No channels configured; pass --channel or set channels.names");
    }

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested, draining queued messages");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let service = IngestService::new(source, pipeline, ServiceOptions::from_config(&config.ingest));
    let report = service.run(&config.channels.names, shutdown_rx).await?;

    for backfill in &report.backfills {
        tracing::info!(
            channel = %backfill.channel,
            seen = backfill.seen,
            saved = backfill.saved,
            duplicates = backfill.duplicates,
            media_stored = backfill.media_stored,
            abandoned = backfill.abandoned,
            "Backfill summary"
        );
    }
    for (name, reason) in &report.unreachable {
        tracing::warn!(channel = %name, reason = %reason, "Channel was unreachable");
    }
    if let Some(ref live) = report.live {
        tracing::info!(received = live.received, dispatched = live.dispatched, "Live summary");
    }

    // Close the event bus so the audit writer drains and exits.
    drop(service);
    drop(events);
    if let Some(task) = audit_task {
        let _ = task.await;
    }

    tracing::info!("Feedkeeper stopped");
    Ok(())
}

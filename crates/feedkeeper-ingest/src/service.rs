//! Ingest service: resolves channels and runs backfill and live ingestion
//! side by side until the subscription ends or shutdown is requested.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use feedkeeper_core::config::IngestConfig;
use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::events::{EventBus, IngestEvent};
use feedkeeper_core::types::ChannelId;

use crate::backfill::{BackfillCoordinator, BackfillOptions, BackfillReport};
use crate::channel::{ChannelSource, LiveMessage};
use crate::live::{LiveDispatcher, LiveReport};
use crate::pipeline::IngestionPipeline;
use crate::shutdown::shutdown_signalled;
use crate::worker::{spawn_worker, ChannelHandle, WorkerStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub queue_capacity: usize,
    pub backfill: BackfillOptions,
    /// Subscribe to the live feed. When off, only the backfill runs.
    pub live: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

impl ServiceOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            backfill: BackfillOptions::from_config(config),
            live: config.live,
        }
    }
}

/// What a service run did, per channel.
#[derive(Debug, Default)]
pub struct ServiceReport {
    pub resolved: Vec<ChannelId>,
    /// Configured names that could not be resolved, with the reason.
    pub unreachable: Vec<(String, String)>,
    pub backfills: Vec<BackfillReport>,
    pub live: Option<LiveReport>,
    pub workers: Vec<(ChannelId, WorkerStats)>,
}

pub struct IngestService {
    source: Arc<dyn ChannelSource>,
    pipeline: Arc<IngestionPipeline>,
    events: EventBus,
    options: ServiceOptions,
}

impl IngestService {
    pub fn new(
        source: Arc<dyn ChannelSource>,
        pipeline: Arc<IngestionPipeline>,
        options: ServiceOptions,
    ) -> Self {
        let events = pipeline.events().clone();
        Self {
            source,
            pipeline,
            events,
            options,
        }
    }

    /// Run ingestion for `channel_names`.
    ///
    /// Returns once every backfill has finished and the live feed has ended
    /// (or shutdown was signalled), and every queued message was processed.
    pub async fn run(
        &self,
        channel_names: &[String],
        shutdown: watch::Receiver<bool>,
    ) -> Result<ServiceReport, FeedkeeperError> {
        let mut report = ServiceReport::default();

        for name in channel_names {
            match self.source.get_channel_identity(name).await {
                Ok(channel) => {
                    if report.resolved.contains(&channel) {
                        warn!(name = %name, channel = %channel, "Channel listed twice, ignoring");
                        continue;
                    }
                    info!(name = %name, channel = %channel, "Channel resolved");
                    report.resolved.push(channel);
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(name = %name, error = %reason, "Channel unreachable, skipping");
                    self.events.publish(IngestEvent::ChannelUnreachable {
                        channel: name.clone(),
                        reason: reason.clone(),
                        timestamp: Utc::now(),
                    });
                    report.unreachable.push((name.clone(), reason));
                }
            }
        }

        if report.resolved.is_empty() {
            warn!("No channel could be resolved, nothing to ingest");
            return Ok(report);
        }

        let mut handles: Vec<ChannelHandle> = Vec::with_capacity(report.resolved.len());
        let mut workers = Vec::with_capacity(report.resolved.len());
        for channel in &report.resolved {
            let (handle, task) = spawn_worker(
                channel.clone(),
                self.pipeline.clone(),
                self.options.queue_capacity,
            );
            handles.push(handle);
            workers.push((channel.clone(), task));
        }

        let live_task = if self.options.live {
            Some(self.spawn_live(report.resolved.clone(), handles.clone(), shutdown.clone()))
        } else {
            None
        };

        let coordinator = BackfillCoordinator::new(
            self.source.clone(),
            self.pipeline.clone(),
            self.options.backfill.clone(),
        );
        let mut backfills = JoinSet::new();
        for handle in handles.drain(..) {
            let coordinator = coordinator.clone();
            let mut shutdown = shutdown.clone();
            backfills.spawn(async move { coordinator.run(&handle, &mut shutdown).await });
        }

        while let Some(joined) = backfills.join_next().await {
            match joined {
                Ok(Ok(backfill)) => report.backfills.push(backfill),
                Ok(Err(e)) => error!(error = %e, "Backfill failed"),
                Err(e) => error!(error = %e, "Backfill task panicked"),
            }
        }

        if let Some(live_task) = live_task {
            match live_task.await {
                Ok(live) => report.live = Some(live),
                Err(e) => error!(error = %e, "Live task panicked"),
            }
        }

        // Every producer handle is gone now; workers drain and exit.
        for (channel, task) in workers {
            match task.await {
                Ok(stats) => report.workers.push((channel, stats)),
                Err(e) => error!(channel = %channel, error = %e, "Channel worker panicked"),
            }
        }

        info!(
            resolved = report.resolved.len(),
            unreachable = report.unreachable.len(),
            "Ingest service stopped"
        );
        Ok(report)
    }

    /// Start the subscription and its dispatcher. The dispatcher owns the
    /// live producer handles and drops them when it returns.
    fn spawn_live(
        &self,
        channels: Vec<ChannelId>,
        handles: Vec<ChannelHandle>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<LiveReport> {
        let (tx, rx) = mpsc::channel::<LiveMessage>(self.options.queue_capacity.max(1));
        let source = self.source.clone();
        let mut subscription_shutdown = shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = source.subscribe(&channels, tx) => match result {
                    Ok(()) => info!("Live subscription ended"),
                    Err(e) => warn!(error = %e, "Live subscription failed"),
                },
                _ = shutdown_signalled(&mut subscription_shutdown) => {
                    info!("Live subscription cancelled by shutdown");
                }
            }
        });

        let dispatcher = LiveDispatcher::new(handles);
        tokio::spawn(dispatcher.run(rx, shutdown))
    }
}

//! Per-channel funnel.
//!
//! Each channel has one worker task that drains a bounded queue and runs
//! every request through the [`IngestionPipeline`] in arrival order. Backfill
//! and live producers of the same channel share the queue, so a channel's
//! inserts and retention passes never interleave. Different channels run in
//! parallel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::types::ChannelId;

use crate::pipeline::{IngestOutcome, IngestRequest, IngestionPipeline};

type Reply = oneshot::Sender<Result<IngestOutcome, FeedkeeperError>>;

enum Job {
    Ingest {
        request: IngestRequest,
        reply: Option<Reply>,
    },
    /// Run a retention pass in queue order and report the eviction count.
    Enforce { reply: oneshot::Sender<usize> },
}

/// Counters kept by a worker over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub saved: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub evicted: u64,
}

/// Producer side of a channel's queue.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: ChannelId,
    tx: mpsc::Sender<Job>,
}

impl ChannelHandle {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Queue a request and wait for its outcome.
    pub async fn submit(&self, request: IngestRequest) -> Result<IngestOutcome, FeedkeeperError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job::Ingest {
                request,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| FeedkeeperError::ShuttingDown)?;
        reply_rx.await.map_err(|_| FeedkeeperError::ShuttingDown)?
    }

    /// Queue a request without waiting for its outcome. Waits only for
    /// queue capacity.
    pub async fn enqueue(&self, request: IngestRequest) -> Result<(), FeedkeeperError> {
        self.tx
            .send(Job::Ingest {
                request,
                reply: None,
            })
            .await
            .map_err(|_| FeedkeeperError::ShuttingDown)
    }

    /// Run a retention pass after everything queued so far. Returns the
    /// number of records evicted.
    pub async fn enforce_retention(&self) -> Result<usize, FeedkeeperError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job::Enforce { reply: reply_tx })
            .await
            .map_err(|_| FeedkeeperError::ShuttingDown)?;
        reply_rx.await.map_err(|_| FeedkeeperError::ShuttingDown)
    }
}

/// Start the worker for `channel`.
///
/// The worker exits once every [`ChannelHandle`] has been dropped and the
/// queue is drained; its stats are returned through the join handle.
pub fn spawn_worker(
    channel: ChannelId,
    pipeline: Arc<IngestionPipeline>,
    capacity: usize,
) -> (ChannelHandle, JoinHandle<WorkerStats>) {
    let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
    let handle = ChannelHandle {
        channel: channel.clone(),
        tx,
    };

    let task = tokio::spawn(async move {
        let mut stats = WorkerStats::default();
        debug!(channel = %channel, "Channel worker started");

        while let Some(job) = rx.recv().await {
            match job {
                Job::Ingest { request, reply } => {
                    let result = pipeline.ingest(request).await;
                    stats.processed += 1;
                    match &result {
                        Ok(IngestOutcome::Saved { evicted, .. }) => {
                            stats.saved += 1;
                            stats.evicted += *evicted as u64;
                        }
                        Ok(IngestOutcome::Duplicate) => stats.duplicates += 1,
                        Err(_) => stats.failed += 1,
                    }
                    if let Some(reply) = reply {
                        // The submitter may have given up; its outcome is already logged.
                        let _ = reply.send(result);
                    }
                }
                Job::Enforce { reply } => {
                    let evicted = pipeline.enforce_retention(&channel).await;
                    stats.evicted += evicted as u64;
                    let _ = reply.send(evicted);
                }
            }
        }

        info!(
            channel = %channel,
            processed = stats.processed,
            saved = stats.saved,
            duplicates = stats.duplicates,
            failed = stats.failed,
            evicted = stats.evicted,
            "Channel worker stopped"
        );
        stats
    });

    (handle, task)
}

//! One-time history walk per channel at startup.
//!
//! The coordinator reads the remaining media budget of the channel, walks
//! its history newest-first and submits every message through the channel's
//! funnel, allowing a download only while budget remains. The budget is
//! spent only by messages whose media was actually stored, so a walk never
//! adds more than `cap - existing` media records on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use feedkeeper_core::config::IngestConfig;
use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::events::IngestEvent;
use feedkeeper_core::types::{ChannelId, RawMessage};

use crate::channel::ChannelSource;
use crate::pipeline::{IngestOutcome, IngestRequest, IngestionPipeline, MediaOutcome};
use crate::shutdown::shutdown_signalled;
use crate::worker::ChannelHandle;

/// Retry policy for messages whose record store write failed transiently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOptions {
    /// Extra attempts after the first one.
    pub retry_attempts: u32,
    /// Delay before retry `n` is `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl BackfillOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            retry_attempts: config.storage_retry_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Delay before retry `attempt`, saturating instead of overflowing.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }
}

/// Summary of one channel's history walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub channel: ChannelId,
    /// Media budget at the start of the walk.
    pub media_budget: u64,
    pub seen: u64,
    pub saved: u64,
    pub duplicates: u64,
    pub media_stored: u64,
    pub media_failed: u64,
    /// Messages whose attachment was skipped because the budget ran out.
    pub media_skipped: u64,
    pub abandoned: u64,
    /// Records evicted by the final retention pass.
    pub evicted_after: usize,
    /// The walk stopped early because shutdown was requested.
    pub interrupted: bool,
    /// The history could not be read (fully or from some point on).
    pub history_error: Option<String>,
}

impl BackfillReport {
    fn new(channel: ChannelId, media_budget: u64) -> Self {
        Self {
            channel,
            media_budget,
            seen: 0,
            saved: 0,
            duplicates: 0,
            media_stored: 0,
            media_failed: 0,
            media_skipped: 0,
            abandoned: 0,
            evicted_after: 0,
            interrupted: false,
            history_error: None,
        }
    }

    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Duplicate => self.duplicates += 1,
            IngestOutcome::Saved { media, .. } => {
                self.saved += 1;
                match media {
                    MediaOutcome::Stored(_) => self.media_stored += 1,
                    MediaOutcome::Failed(_) => self.media_failed += 1,
                    MediaOutcome::BudgetExhausted => self.media_skipped += 1,
                    MediaOutcome::NotPresent => {}
                }
            }
        }
    }
}

/// Runs history walks. Cheap to clone; one clone per channel task.
#[derive(Clone)]
pub struct BackfillCoordinator {
    source: Arc<dyn ChannelSource>,
    pipeline: Arc<IngestionPipeline>,
    options: BackfillOptions,
}

impl BackfillCoordinator {
    pub fn new(
        source: Arc<dyn ChannelSource>,
        pipeline: Arc<IngestionPipeline>,
        options: BackfillOptions,
    ) -> Self {
        Self {
            source,
            pipeline,
            options,
        }
    }

    /// Walk the history of `handle`'s channel.
    ///
    /// Fails only when the starting budget cannot be read; a history that
    /// cannot be read is reported in [`BackfillReport::history_error`].
    pub async fn run(
        &self,
        handle: &ChannelHandle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<BackfillReport, FeedkeeperError> {
        let channel = handle.channel().clone();
        let mut budget = self.initial_budget(&channel).await?;
        let run_id = Uuid::new_v4();
        let mut report = BackfillReport::new(channel.clone(), budget);

        info!(channel = %channel, %run_id, media_budget = budget, "Backfill started");
        self.pipeline.events().publish(IngestEvent::BackfillStarted {
            run_id,
            channel: channel.clone(),
            media_budget: budget,
            timestamp: Utc::now(),
        });

        match self.source.iterate_history(&channel).await {
            Ok(mut history) => loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown_signalled(shutdown) => {
                        report.interrupted = true;
                        break;
                    }
                    next = history.next() => next,
                };
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        self.history_failed(&channel, &mut report, e.to_string());
                        break;
                    }
                    None => break,
                };

                report.seen += 1;
                match self.submit_with_retry(handle, &message, budget > 0).await {
                    Ok(outcome) => {
                        if outcome.stored_media() {
                            budget = budget.saturating_sub(1);
                        }
                        report.record(&outcome);
                    }
                    Err(FeedkeeperError::ShuttingDown) => {
                        report.interrupted = true;
                        break;
                    }
                    Err(_) => report.abandoned += 1,
                }
            },
            Err(e) => self.history_failed(&channel, &mut report, e.to_string()),
        }

        if !report.interrupted {
            report.evicted_after = handle.enforce_retention().await.unwrap_or(0);
        }

        info!(
            channel = %channel,
            %run_id,
            seen = report.seen,
            saved = report.saved,
            duplicates = report.duplicates,
            media_stored = report.media_stored,
            media_failed = report.media_failed,
            media_skipped = report.media_skipped,
            abandoned = report.abandoned,
            interrupted = report.interrupted,
            "Backfill completed"
        );
        self.pipeline.events().publish(IngestEvent::BackfillCompleted {
            run_id,
            channel,
            seen: report.seen,
            saved: report.saved,
            duplicates: report.duplicates,
            media_stored: report.media_stored,
            abandoned: report.abandoned,
            timestamp: Utc::now(),
        });

        Ok(report)
    }

    async fn initial_budget(&self, channel: &ChannelId) -> Result<u64, FeedkeeperError> {
        let mut attempt = 0;
        loop {
            match self.pipeline.retention().remaining_budget(channel) {
                Ok(budget) => return Ok(budget),
                Err(e) if e.is_retryable() && attempt < self.options.retry_attempts => {
                    attempt += 1;
                    warn!(channel = %channel, attempt, error = %e, "Media budget unavailable, retrying");
                    tokio::time::sleep(self.options.backoff_for(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// History is not restartable, so a transient store failure is retried
    /// for the single message rather than for the walk.
    async fn submit_with_retry(
        &self,
        handle: &ChannelHandle,
        message: &RawMessage,
        allow_media: bool,
    ) -> Result<IngestOutcome, FeedkeeperError> {
        let mut attempt = 0;
        loop {
            let request = IngestRequest::backfill(handle.channel().clone(), message.clone(), allow_media);
            match handle.submit(request).await {
                Err(e) if e.is_retryable() && attempt < self.options.retry_attempts => {
                    attempt += 1;
                    warn!(
                        channel = %handle.channel(),
                        message_id = message.id,
                        attempt,
                        error = %e,
                        "Retrying message after storage failure"
                    );
                    tokio::time::sleep(self.options.backoff_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    fn history_failed(&self, channel: &ChannelId, report: &mut BackfillReport, reason: String) {
        warn!(channel = %channel, error = %reason, "Channel history unavailable");
        self.pipeline.events().publish(IngestEvent::ChannelUnreachable {
            channel: channel.to_string(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        report.history_error = Some(reason);
    }
}

//! End-to-end properties of the ingestion pipeline.
//!
//! Every test builds its own stack on an in-memory database and a temporary
//! media directory, with a scripted channel source.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::events::{EventBus, IngestEvent};
use feedkeeper_core::types::{ChannelId, MessageRecord, NewMessageRecord, RawMessage};
use feedkeeper_ingest::{
    shutdown_channel, BackfillOptions, ChannelSource, IngestOutcome, IngestRequest, IngestService,
    IngestionPipeline, MockChannelSource, ServiceOptions,
};
use feedkeeper_storage::{
    Database, MediaStore, MessageRepository, RecordStore, RetentionEnforcer, UpsertOutcome,
};

// =============================================================================
// Helpers
// =============================================================================

/// Record store that fails a scripted number of calls with
/// `StorageUnavailable` before delegating.
struct FlakyStore {
    inner: Arc<MessageRepository>,
    failing_upserts: AtomicU32,
    failing_counts: Arc<AtomicU32>,
}

impl FlakyStore {
    fn failing_upserts(inner: Arc<MessageRepository>, failures: u32) -> Self {
        Self {
            inner,
            failing_upserts: AtomicU32::new(failures),
            failing_counts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Counts fail while the shared counter is above zero.
    fn failing_counts(inner: Arc<MessageRepository>, failures: Arc<AtomicU32>) -> Self {
        Self {
            inner,
            failing_upserts: AtomicU32::new(0),
            failing_counts: failures,
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn unavailable() -> FeedkeeperError {
    FeedkeeperError::StorageUnavailable("database is locked".to_string())
}

impl RecordStore for FlakyStore {
    fn upsert_if_absent(&self, record: &NewMessageRecord) -> Result<UpsertOutcome, FeedkeeperError> {
        if Self::take_failure(&self.failing_upserts) {
            return Err(unavailable());
        }
        self.inner.upsert_if_absent(record)
    }

    fn contains(&self, channel: &ChannelId, id: i64) -> Result<bool, FeedkeeperError> {
        self.inner.contains(channel, id)
    }

    fn find(&self, channel: &ChannelId, id: i64) -> Result<Option<MessageRecord>, FeedkeeperError> {
        self.inner.find(channel, id)
    }

    fn count_media_records(&self, channel: &ChannelId) -> Result<u64, FeedkeeperError> {
        if Self::take_failure(&self.failing_counts) {
            return Err(unavailable());
        }
        self.inner.count_media_records(channel)
    }

    fn delete_oldest_media_records(
        &self,
        channel: &ChannelId,
        count: u64,
    ) -> Result<Vec<MessageRecord>, FeedkeeperError> {
        self.inner.delete_oldest_media_records(channel, count)
    }

    fn list_messages(
        &self,
        channel: &ChannelId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<MessageRecord>, FeedkeeperError> {
        self.inner.list_messages(channel, offset, limit)
    }
}

struct Stack {
    _dir: tempfile::TempDir,
    repo: Arc<MessageRepository>,
    media: Arc<MediaStore>,
    source: Arc<MockChannelSource>,
    pipeline: Arc<IngestionPipeline>,
    events: EventBus,
}

impl Stack {
    fn new(cap: u64, source: MockChannelSource) -> Self {
        Self::with_store(cap, source, |repo| repo as Arc<dyn RecordStore>)
    }

    fn with_store(
        cap: u64,
        source: MockChannelSource,
        wrap: impl FnOnce(Arc<MessageRepository>) -> Arc<dyn RecordStore>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(MessageRepository::new(Arc::new(Database::in_memory().unwrap())));
        let store = wrap(repo.clone());
        let media = Arc::new(MediaStore::new(dir.path().join("media"), "jpg"));
        let retention = Arc::new(RetentionEnforcer::new(store.clone(), media.clone(), cap));
        let source = Arc::new(source);
        let events = EventBus::new(4096);
        let pipeline = Arc::new(IngestionPipeline::new(
            store,
            media.clone(),
            retention,
            source.clone(),
            events.clone(),
        ));
        Self {
            _dir: dir,
            repo,
            media,
            source,
            pipeline,
            events,
        }
    }

    fn service(&self, live: bool) -> IngestService {
        let source: Arc<dyn ChannelSource> = self.source.clone();
        IngestService::new(
            source,
            self.pipeline.clone(),
            ServiceOptions {
                queue_capacity: 4,
                backfill: BackfillOptions {
                    retry_attempts: 3,
                    retry_backoff: Duration::from_millis(1),
                },
                live,
            },
        )
    }

    /// Run the service to completion with a shutdown that never fires.
    async fn run(&self, names: &[&str], live: bool) -> feedkeeper_ingest::ServiceReport {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let (_stop, shutdown) = shutdown_channel();
        self.service(live).run(&names, shutdown).await.unwrap()
    }

    async fn ingest_live(&self, channel: &ChannelId, id: i64, has_media: bool) -> IngestOutcome {
        self.pipeline
            .ingest(IngestRequest::live(channel.clone(), msg(id, id, has_media)))
            .await
            .unwrap()
    }

    fn media_ids(&self, channel: &ChannelId) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .repo
            .list_messages(channel, 0, 500)
            .unwrap()
            .into_iter()
            .filter(|r| r.is_media_bearing())
            .map(|r| r.source_message_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn msg(id: i64, arrival: i64, has_media: bool) -> RawMessage {
    RawMessage {
        id,
        text: Some(format!("post {}", id)),
        timestamp: Utc.timestamp_opt(arrival, 0).unwrap(),
        has_media,
    }
}

fn history(ids: std::ops::RangeInclusive<i64>, has_media: bool) -> Vec<RawMessage> {
    ids.map(|id| msg(id, 1_000 + id, has_media)).collect()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<IngestEvent>) -> Vec<IngestEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingest_of_same_message_stores_one_record() {
    let stack = Stack::new(150, MockChannelSource::new().with_download_delay(Duration::from_millis(5)));
    let channel = ChannelId::new("Chemed");

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let pipeline = stack.pipeline.clone();
            let request = if i % 2 == 0 {
                IngestRequest::live(channel.clone(), msg(42, 42, true))
            } else {
                IngestRequest::backfill(channel.clone(), msg(42, 42, true), true)
            };
            tokio::spawn(async move { pipeline.ingest(request).await.unwrap() })
        })
        .collect();

    let mut saved = 0;
    for task in tasks {
        if matches!(task.await.unwrap(), IngestOutcome::Saved { .. }) {
            saved += 1;
        }
    }
    assert_eq!(saved, 1);
    assert_eq!(stack.repo.count(&channel).unwrap(), 1);

    let record = stack.repo.find(&channel, 42).unwrap().unwrap();
    let path = record.media_path.expect("media stored");
    assert!(stack.media.exists(&path).await.unwrap());
}

#[tokio::test]
async fn second_backfill_over_same_history_adds_nothing() {
    let stack = Stack::new(150, MockChannelSource::new().with_channel("DoctorsET", history(1..=12, true)));
    let channel = ChannelId::new("DoctorsET");

    let first = stack.run(&["DoctorsET"], false).await;
    assert_eq!(first.backfills[0].saved, 12);
    let downloads = stack.source.download_count();

    let second = stack.run(&["DoctorsET"], false).await;
    assert_eq!(second.backfills[0].saved, 0);
    assert_eq!(second.backfills[0].duplicates, 12);
    assert_eq!(stack.repo.count(&channel).unwrap(), 12);
    // Duplicates never download again.
    assert_eq!(stack.source.download_count(), downloads);
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn media_count_never_exceeds_cap_after_an_insert() {
    let stack = Stack::new(3, MockChannelSource::new());
    let channel = ChannelId::new("lobelia4cosmetics");

    // Mixed media and text-only messages, arriving out of order.
    let arrivals = [7, 3, 9, 1, 12, 5, 2, 11, 8, 4, 10, 6];
    for (i, arrival) in arrivals.iter().enumerate() {
        let has_media = i % 3 != 2;
        stack
            .pipeline
            .ingest(IngestRequest::live(channel.clone(), msg(i as i64 + 1, *arrival, has_media)))
            .await
            .unwrap();
        assert!(stack.repo.count_media_records(&channel).unwrap() <= 3);
    }
    assert_eq!(stack.repo.count_media_records(&channel).unwrap(), 3);
}

#[tokio::test]
async fn eviction_removes_oldest_media_first() {
    let stack = Stack::new(3, MockChannelSource::new());
    let channel = ChannelId::new("Chemed");

    // Four media records already stored, over the cap of the current run.
    for t in 1..=4 {
        let path = stack.media.save(&channel, t, b"old").await.unwrap();
        stack
            .repo
            .upsert_if_absent(&NewMessageRecord::from_raw(&channel, &msg(t, t, true), Some(path)))
            .unwrap();
    }

    let mut events = stack.events.subscribe();
    let outcome = stack
        .pipeline
        .ingest(IngestRequest::live(channel.clone(), msg(5, 5, true)))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Saved { evicted: 2, .. }));
    assert_eq!(stack.media_ids(&channel), vec![3, 4, 5]);

    let evicted: Vec<i64> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            IngestEvent::MediaEvicted { message_id, .. } => Some(message_id),
            _ => None,
        })
        .collect();
    assert_eq!(evicted, vec![1, 2]);

    // The evicted files are gone, the kept ones are not.
    assert!(!stack.media.exists(&stack.media.path_for(&channel, 1).to_string_lossy()).await.unwrap());
    assert!(stack.media.exists(&stack.media.path_for(&channel, 3).to_string_lossy()).await.unwrap());
}

#[tokio::test]
async fn failed_enforcement_heals_on_next_media_insert() {
    let failures = Arc::new(AtomicU32::new(0));
    let shared = failures.clone();
    let stack = Stack::with_store(1, MockChannelSource::new(), move |repo| {
        Arc::new(FlakyStore::failing_counts(repo, shared)) as Arc<dyn RecordStore>
    });
    let channel = ChannelId::new("c");

    stack.ingest_live(&channel, 1, true).await;

    failures.store(1, Ordering::SeqCst);
    let mut events = stack.events.subscribe();
    stack.ingest_live(&channel, 2, true).await;
    assert!(drain(&mut events).iter().any(|e| e.kind() == "retention_deferred"));
    assert_eq!(stack.media_ids(&channel), vec![1, 2]);

    // Text-only inserts do not run enforcement.
    stack.ingest_live(&channel, 3, false).await;
    assert_eq!(stack.media_ids(&channel), vec![1, 2]);

    stack.ingest_live(&channel, 4, true).await;
    assert_eq!(stack.media_ids(&channel), vec![4]);
}

// =============================================================================
// Media failures and budget
// =============================================================================

#[tokio::test]
async fn failed_download_still_records_message_once() {
    let source = MockChannelSource::new()
        .with_channel("yetenaweg", vec![msg(7, 7, true)])
        .fail_download("yetenaweg", 7);
    let stack = Stack::new(150, source);
    let channel = ChannelId::new("yetenaweg");

    let report = stack.run(&["yetenaweg"], false).await;
    assert_eq!(report.backfills[0].media_failed, 1);
    assert_eq!(report.backfills[0].saved, 1);

    let record = stack.repo.find(&channel, 7).unwrap().unwrap();
    assert!(record.media_path.is_none());
    assert_eq!(stack.repo.count(&channel).unwrap(), 1);
}

#[tokio::test]
async fn backfill_downloads_only_the_remaining_budget() {
    let stack = Stack::new(150, MockChannelSource::new().with_channel("EAHCI", history(1..=10, true)));
    let channel = ChannelId::new("EAHCI");

    for id in 0..148 {
        stack
            .repo
            .upsert_if_absent(&NewMessageRecord {
                channel: channel.clone(),
                source_message_id: 10_000 + id,
                text: None,
                arrival_time: Utc.timestamp_opt(id, 0).unwrap(),
                media_path: Some(format!("/nonexistent/{}.jpg", id)),
            })
            .unwrap();
    }

    let report = stack.run(&["EAHCI"], false).await;
    let backfill = &report.backfills[0];
    assert_eq!(backfill.media_budget, 2);
    assert_eq!(backfill.media_stored, 2);
    assert_eq!(backfill.media_skipped, 8);
    assert_eq!(backfill.evicted_after, 0);

    let with_media = (1..=10)
        .filter(|id| stack.repo.find(&channel, *id).unwrap().unwrap().media_path.is_some())
        .count();
    assert_eq!(with_media, 2);
    assert_eq!(stack.repo.count_media_records(&channel).unwrap(), 150);
    assert_eq!(stack.source.download_count(), 2);
}

#[tokio::test]
async fn transient_storage_failures_are_retried_per_message() {
    let source = MockChannelSource::new().with_channel("c", history(1..=5, false));
    let stack = Stack::with_store(150, source, |repo| {
        Arc::new(FlakyStore::failing_upserts(repo, 2)) as Arc<dyn RecordStore>
    });

    let report = stack.run(&["c"], false).await;
    assert_eq!(report.backfills[0].saved, 5);
    assert_eq!(report.backfills[0].abandoned, 0);
    assert_eq!(stack.repo.count(&ChannelId::new("c")).unwrap(), 5);
}

#[tokio::test]
async fn persistent_storage_failure_abandons_only_that_message() {
    let source = MockChannelSource::new().with_channel("c", history(1..=3, false));
    // Four failures: the first message exhausts its three retries.
    let stack = Stack::with_store(150, source, |repo| {
        Arc::new(FlakyStore::failing_upserts(repo, 4)) as Arc<dyn RecordStore>
    });
    let mut events = stack.events.subscribe();

    let report = stack.run(&["c"], false).await;
    assert_eq!(report.backfills[0].abandoned, 1);
    assert_eq!(report.backfills[0].saved, 2);
    assert!(stack.repo.find(&ChannelId::new("c"), 3).unwrap().is_none());
    assert!(drain(&mut events)
        .iter()
        .any(|e| e.kind() == "message_abandoned" && e.message_id() == Some(3)));
}

// =============================================================================
// Backfill and live together
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_message_from_backfill_and_live_is_stored_once() {
    let source = MockChannelSource::new()
        .with_channel("Chemed", history(1..=20, true))
        .with_live("Chemed", msg(20, 1_020, true))
        .with_live("Chemed", msg(21, 1_021, true))
        .with_download_delay(Duration::from_millis(2));
    let stack = Stack::new(150, source);
    let channel = ChannelId::new("Chemed");

    let report = stack.run(&["Chemed"], true).await;
    let live = report.live.expect("live ran");
    assert_eq!(live.dispatched, 2);

    assert_eq!(stack.repo.count(&channel).unwrap(), 21);
    let record = stack.repo.find(&channel, 20).unwrap().unwrap();
    let path = record.media_path.expect("media stored");
    assert!(stack.media.exists(&path).await.unwrap());

    let (_, stats) = &report.workers[0];
    assert_eq!(stats.saved, 21);
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test]
async fn live_media_is_capped_after_backfill() {
    let mut source = MockChannelSource::new().with_channel("DoctorsET", history(1..=10, true));
    for id in 11..=30 {
        source = source.with_live("DoctorsET", msg(id, 1_000 + id, true));
    }
    let stack = Stack::new(5, source);
    let channel = ChannelId::new("DoctorsET");

    let report = stack.run(&["DoctorsET"], true).await;
    let (_, stats) = &report.workers[0];
    assert_eq!(stats.saved, 30);
    assert_eq!(stats.evicted, 20);

    // Evicted rows are deleted; the budget left 1..=5 text-only.
    assert_eq!(stack.repo.count(&channel).unwrap(), 10);
    assert_eq!(stack.media_ids(&channel), vec![26, 27, 28, 29, 30]);
    for id in 1..=5 {
        let record = stack.repo.find(&channel, id).unwrap().unwrap();
        assert!(record.media_path.is_none());
    }
    for id in 6..=25 {
        assert!(stack.repo.find(&channel, id).unwrap().is_none());
    }
}

// =============================================================================
// Channel failures and shutdown
// =============================================================================

#[tokio::test]
async fn unreachable_channel_does_not_stop_the_others() {
    let source = MockChannelSource::new().with_channel("Chemed", history(1..=3, false));
    let stack = Stack::new(150, source);
    let mut events = stack.events.subscribe();

    let report = stack.run(&["Chemed", "lobelia4cosmetics"], true).await;
    assert_eq!(report.resolved, vec![ChannelId::new("Chemed")]);
    assert_eq!(report.unreachable.len(), 1);
    assert_eq!(report.unreachable[0].0, "lobelia4cosmetics");
    assert_eq!(stack.repo.count(&ChannelId::new("Chemed")).unwrap(), 3);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, IngestEvent::ChannelUnreachable { channel, .. } if channel == "lobelia4cosmetics")));
}

#[tokio::test]
async fn history_failure_is_confined_to_its_channel() {
    let source = MockChannelSource::new()
        .with_channel("a", history(1..=4, false))
        .with_channel("b", history(1..=4, false))
        .with_history_error("a", 1, "flood wait");
    let stack = Stack::new(150, source);

    let report = stack.run(&["a", "b"], false).await;
    assert_eq!(stack.repo.count(&ChannelId::new("a")).unwrap(), 1);
    assert_eq!(stack.repo.count(&ChannelId::new("b")).unwrap(), 4);
    let failed: Vec<_> = report
        .backfills
        .iter()
        .filter(|b| b.history_error.is_some())
        .map(|b| b.channel.clone())
        .collect();
    assert_eq!(failed, vec![ChannelId::new("a")]);
}

#[tokio::test]
async fn shutdown_before_start_ingests_nothing_and_returns() {
    let mut source = MockChannelSource::new().with_channel("c", history(1..=100, false));
    for id in 101..=110 {
        source = source.with_live("c", msg(id, id, false));
    }
    let stack = Stack::new(150, source);

    let (stop, shutdown) = shutdown_channel();
    stop.send(true).unwrap();
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        stack.service(true).run(&["c".to_string()], shutdown),
    )
    .await
    .expect("service stops")
    .unwrap();

    assert!(report.backfills[0].interrupted);
    assert_eq!(report.backfills[0].seen, 0);
    assert_eq!(stack.repo.count(&ChannelId::new("c")).unwrap(), 0);
}

#[tokio::test]
async fn no_resolvable_channel_is_not_an_error() {
    let stack = Stack::new(150, MockChannelSource::new());
    let report = stack.run(&["missing"], true).await;
    assert!(report.resolved.is_empty());
    assert!(report.backfills.is_empty());
    assert!(report.live.is_none());
}

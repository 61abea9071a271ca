//! JSON-lines audit trail of every ingest outcome.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use feedkeeper_core::events::IngestEvent;

/// Append every event received on `events` to `path`, one JSON object per
/// line, until every sender of the bus is dropped.
///
/// The receiver is subscribed by the caller so nothing published between
/// spawning the writer and opening the file is missed.
pub async fn audit_writer(path: PathBuf, events: broadcast::Receiver<IngestEvent>) {
    let mut stream = BroadcastStream::new(events);

    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Audit log unavailable");
            return;
        }
    };
    tracing::info!(path = %path.display(), "Audit log enabled");

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Audit log fell behind, events dropped");
                continue;
            }
        };
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize audit event");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "Failed to write audit event");
        }
    }

    let _ = file.flush().await;
}

//! Channel source backed by exported channel archives.
//!
//! Layout of the export directory:
//!
//! ```text
//! <root>/<channel>/messages.jsonl   one message per line
//! <root>/<channel>/<media files>    attachments, referenced by `media`
//! ```
//!
//! A history line is `{"id": 12, "text": "...", "date": "2024-05-01T09:30:00Z",
//! "media": "photos/12.jpg"}`; `text` and `media` may be omitted. History is
//! streamed line by line in file order, so exports are written newest-first,
//! the order the channel history API yields them. The live feed
//! is read from any async line reader and carries the same fields plus
//! `"channel"`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use feedkeeper_core::types::{ChannelId, RawMessage};

use crate::channel::{ChannelError, ChannelSource, HistoryStream, LiveMessage};

const HISTORY_FILE: &str = "messages.jsonl";

type LiveReader = Box<dyn AsyncBufRead + Send + Unpin>;
type MediaIndex = Arc<Mutex<HashMap<(ChannelId, i64), PathBuf>>>;

#[derive(Debug, Deserialize)]
struct ExportedMessage {
    id: i64,
    #[serde(default)]
    text: Option<String>,
    date: DateTime<Utc>,
    #[serde(default)]
    media: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportedLiveMessage {
    channel: String,
    #[serde(flatten)]
    message: ExportedMessage,
}

pub struct ReplayChannelSource {
    root: PathBuf,
    live: Mutex<Option<LiveReader>>,
    media_index: MediaIndex,
}

impl ReplayChannelSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            live: Mutex::new(None),
            media_index: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read live messages from `reader`, one JSON object per line, until EOF.
    pub fn with_live_input(self, reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        if let Ok(mut live) = self.live.lock() {
            *live = Some(Box::new(reader));
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel: &ChannelId) -> PathBuf {
        self.root.join(channel.as_str())
    }

    /// Find the export directory whose name matches `name`, ignoring case
    /// and a leading `@`.
    async fn resolve(&self, name: &str) -> Result<ChannelId, ChannelError> {
        let wanted = name.trim().trim_start_matches('@');
        let unreachable = |reason: String| ChannelError::Unreachable {
            channel: name.to_string(),
            reason,
        };

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| unreachable(format!("cannot read {}: {}", self.root.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && dir_name.eq_ignore_ascii_case(wanted) {
                return Ok(ChannelId::new(dir_name));
            }
        }
        Err(unreachable("no export directory".to_string()))
    }

    fn index_media(&self, channel: &ChannelId, message: &ExportedMessage) {
        index_media(&self.media_index, &self.channel_dir(channel), channel, message);
    }

    fn to_raw(message: ExportedMessage) -> RawMessage {
        RawMessage {
            id: message.id,
            has_media: message.media.is_some(),
            text: message.text,
            timestamp: message.date,
        }
    }
}

#[async_trait]
impl ChannelSource for ReplayChannelSource {
    async fn get_channel_identity(&self, name: &str) -> Result<ChannelId, ChannelError> {
        self.resolve(name).await
    }

    async fn iterate_history(&self, channel: &ChannelId) -> Result<HistoryStream, ChannelError> {
        let dir = self.channel_dir(channel);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(ChannelError::Unreachable {
                channel: channel.to_string(),
                reason: format!("{} does not exist", dir.display()),
            });
        }

        let path = dir.join(HISTORY_FILE);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(channel = %channel, "No exported history");
                return Ok(Box::pin(tokio_stream::empty::<Result<RawMessage, ChannelError>>()));
            }
            Err(e) => {
                return Err(ChannelError::Transport(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(channel = %channel, path = %path.display(), "Replaying channel history");
        let index = Arc::clone(&self.media_index);
        let channel = channel.clone();
        let mut line_no = 0usize;
        let stream = LinesStream::new(BufReader::new(file).lines()).filter_map(move |line| {
            line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(ChannelError::Transport(format!(
                        "Failed to read {} line {}: {}",
                        path.display(),
                        line_no,
                        e
                    ))))
                }
            };
            if line.trim().is_empty() {
                return None;
            }
            match serde_json::from_str::<ExportedMessage>(&line) {
                Ok(message) => {
                    index_media(&index, &dir, &channel, &message);
                    Some(Ok(Self::to_raw(message)))
                }
                Err(e) => {
                    warn!(
                        channel = %channel,
                        line = line_no,
                        error = %e,
                        "Skipping malformed history line"
                    );
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn subscribe(
        &self,
        channels: &[ChannelId],
        sink: mpsc::Sender<LiveMessage>,
    ) -> Result<(), ChannelError> {
        let reader = match self.live.lock() {
            Ok(mut live) => live.take(),
            Err(_) => None,
        };
        let Some(reader) = reader else {
            debug!("No live input configured");
            return Ok(());
        };

        info!(channels = channels.len(), "Live replay started");
        let mut lines = reader.lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let live = match serde_json::from_str::<ExportedLiveMessage>(&line) {
                Ok(live) => live,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed live line");
                    continue;
                }
            };
            let channel = self
                .resolve(&live.channel)
                .await
                .unwrap_or_else(|_| ChannelId::new(live.channel.as_str()));
            self.index_media(&channel, &live.message);

            let message = LiveMessage {
                channel,
                message: Self::to_raw(live.message),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        info!("Live replay ended");
        Ok(())
    }

    async fn download_media(
        &self,
        channel: &ChannelId,
        message: &RawMessage,
    ) -> Result<Vec<u8>, ChannelError> {
        let path = self
            .media_index
            .lock()
            .ok()
            .and_then(|index| index.get(&(channel.clone(), message.id)).cloned())
            .ok_or_else(|| ChannelError::MediaUnavailable {
                message_id: message.id,
                reason: "no attachment exported".to_string(),
            })?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ChannelError::MediaUnavailable {
                message_id: message.id,
                reason: format!("{}: {}", path.display(), e),
            })
    }
}

fn index_media(index: &MediaIndex, dir: &Path, channel: &ChannelId, message: &ExportedMessage) {
    let Some(media) = message.media.as_deref() else {
        return;
    };
    if let Ok(mut index) = index.lock() {
        index.insert((channel.clone(), message.id), dir.join(media));
    }
}

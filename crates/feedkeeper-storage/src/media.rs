//! Media store: one file per message under `<root>/<channel>/<id>.<ext>`.
//!
//! Paths are derived only from the channel and the source message id, so
//! saving the same attachment twice lands on the same file.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use feedkeeper_core::error::FeedkeeperError;
use feedkeeper_core::types::ChannelId;

/// Filesystem-backed store for downloaded attachments.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    extension: String,
}

impl MediaStore {
    /// Create a store rooted at `root`, giving files the `extension`
    /// (a leading dot is ignored).
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of the media for a message.
    pub fn path_for(&self, channel: &ChannelId, source_message_id: i64) -> PathBuf {
        self.root
            .join(sanitize_component(channel.as_str()))
            .join(format!("{}.{}", source_message_id, self.extension))
    }

    /// Write `bytes` as the media of the message and return the stored path.
    ///
    /// The data goes to a temporary sibling first and is renamed into place,
    /// so readers never observe a partially written file.
    pub async fn save(
        &self,
        channel: &ChannelId,
        source_message_id: i64,
        bytes: &[u8],
    ) -> Result<String, FeedkeeperError> {
        let path = self.path_for(channel, source_message_id);
        let dir = path
            .parent()
            .ok_or_else(|| FeedkeeperError::Media(format!("No parent for {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            FeedkeeperError::Media(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let tmp = dir.join(format!(
            ".{}.{}.{}.part",
            source_message_id,
            std::process::id(),
            next_tmp_suffix()
        ));
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(FeedkeeperError::Media(format!(
                "Failed to write {}: {}",
                path.display(),
                e
            )));
        }

        debug!(path = %path.display(), bytes = bytes.len(), "Media stored");
        Ok(path.to_string_lossy().into_owned())
    }

    /// Remove a stored file. Succeeds if it is already gone.
    pub async fn delete(&self, media_path: &str) -> Result<(), FeedkeeperError> {
        match tokio::fs::remove_file(media_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FeedkeeperError::Media(format!(
                "Failed to delete {}: {}",
                media_path, e
            ))),
        }
    }

    /// Whether a stored file exists at `media_path`.
    pub async fn exists(&self, media_path: &str) -> Result<bool, FeedkeeperError> {
        tokio::fs::try_exists(media_path)
            .await
            .map_err(|e| FeedkeeperError::Media(format!("Failed to stat {}: {}", media_path, e)))
    }
}

/// Encode a channel name as a single directory component.
///
/// ASCII letters, digits and `-` pass through; every other byte, `_`
/// included, becomes `_xx` (lowercase hex). The mapping is injective, so
/// two channels never share a media directory.
fn sanitize_component(name: &str) -> String {
    use std::fmt::Write;

    if name.is_empty() {
        return "_".to_string();
    }
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "_{:02x}", byte);
        }
    }
    encoded
}

fn next_tmp_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FeedkeeperError, Result};
use crate::types::DEFAULT_MEDIA_CAP;

/// Upper bound for `ingest.retry_backoff_ms` (one hour).
pub const MAX_RETRY_BACKOFF_MS: u64 = 3_600_000;

/// Top-level configuration for Feedkeeper.
///
/// Loaded from `~/.feedkeeper/config.toml` by default. Every section is
/// optional and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedkeeperConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl FeedkeeperConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FeedkeeperConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.queue_capacity == 0 {
            return Err(FeedkeeperError::Config(
                "ingest.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.ingest.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(FeedkeeperError::Config(format!(
                "ingest.retry_backoff_ms must be at most {}, got {}",
                MAX_RETRY_BACKOFF_MS, self.ingest.retry_backoff_ms
            )));
        }
        let ext = self.storage.media_extension.trim_start_matches('.');
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FeedkeeperError::Config(format!(
                "storage.media_extension must be alphanumeric, got {:?}",
                self.storage.media_extension
            )));
        }
        let mut seen = HashSet::new();
        for name in &self.channels.names {
            if name.trim().is_empty() {
                return Err(FeedkeeperError::Config(
                    "channels.names contains an empty name".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(FeedkeeperError::Config(format!(
                    "channel {} is listed twice",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Data directory with a leading `~` expanded to the home directory.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Full path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(&self.storage.database_file)
    }

    /// Root directory of the media store.
    pub fn media_root(&self) -> PathBuf {
        let media_dir = Path::new(&self.storage.media_dir);
        if media_dir.is_absolute() {
            media_dir.to_path_buf()
        } else {
            self.data_dir().join(media_dir)
        }
    }
}

/// Expand `~/` (or `~\` on Windows) to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database and media files.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Optional file receiving every ingest event as a JSON line.
    pub audit_log: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.feedkeeper/data".to_string(),
            log_level: "info".to_string(),
            audit_log: None,
        }
    }
}

/// Record and media storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name, relative to the data directory.
    pub database_file: String,
    /// Media root, relative to the data directory unless absolute.
    pub media_dir: String,
    /// File extension given to stored media.
    pub media_extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: "messages.db".to_string(),
            media_dir: "media".to_string(),
            media_extension: "jpg".to_string(),
        }
    }
}

/// Per-channel media retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Maximum media-bearing records kept per channel.
    pub media_cap: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            media_cap: DEFAULT_MEDIA_CAP,
        }
    }
}

/// Channels to ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Channel names as understood by the channel source.
    pub names: Vec<String>,
}

/// Ingestion tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Bounded queue size of each channel's funnel.
    pub queue_capacity: usize,
    /// Attempts per backfilled message when the record store is unavailable.
    pub storage_retry_attempts: u32,
    /// Base delay between those attempts (multiplied by the attempt number).
    pub retry_backoff_ms: u64,
    /// Whether to subscribe to the live feed after resolving channels.
    pub live: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            storage_retry_attempts: 3,
            retry_backoff_ms: 500,
            live: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = FeedkeeperConfig::default();
        assert_eq!(config.general.data_dir, "~/.feedkeeper/data");
        assert_eq!(config.general.log_level, "info");
        assert!(config.general.audit_log.is_none());
        assert_eq!(config.storage.database_file, "messages.db");
        assert_eq!(config.storage.media_extension, "jpg");
        assert_eq!(config.retention.media_cap, 150);
        assert!(config.channels.names.is_empty());
        assert_eq!(config.ingest.queue_capacity, 256);
        assert_eq!(config.ingest.storage_retry_attempts, 3);
        assert!(config.ingest.live);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/srv/feedkeeper"
log_level = "debug"
audit_log = "/srv/feedkeeper/audit.jsonl"

[storage]
media_dir = "/mnt/images"
media_extension = "png"

[retention]
media_cap = 20

[channels]
names = ["DoctorsET", "Chemed", "lobelia4cosmetics", "yetenaweg", "EAHCI"]

[ingest]
queue_capacity = 16
storage_retry_attempts = 5
retry_backoff_ms = 100
live = false
"#;
        let file = create_temp_config(content);
        let config = FeedkeeperConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/srv/feedkeeper");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(
            config.general.audit_log.as_deref(),
            Some("/srv/feedkeeper/audit.jsonl")
        );
        assert_eq!(config.retention.media_cap, 20);
        assert_eq!(config.channels.names.len(), 5);
        assert_eq!(config.ingest.queue_capacity, 16);
        assert!(!config.ingest.live);
        assert_eq!(config.database_path(), PathBuf::from("/srv/feedkeeper/messages.db"));
        assert_eq!(config.media_root(), PathBuf::from("/mnt/images"));
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let file = create_temp_config("[retention]\nmedia_cap = 3\n");
        let config = FeedkeeperConfig::load(file.path()).unwrap();
        assert_eq!(config.retention.media_cap, 3);
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.ingest.queue_capacity, 256);
    }

    #[test]
    fn test_relative_media_dir_is_under_data_dir() {
        let mut config = FeedkeeperConfig::default();
        config.general.data_dir = "/data".to_string();
        assert_eq!(config.media_root(), PathBuf::from("/data/media"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = FeedkeeperConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.retention.media_cap, 150);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(FeedkeeperConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = FeedkeeperConfig::default();
        config.ingest.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(FeedkeeperError::Config(_))));
    }

    #[test]
    fn test_validate_bounds_retry_backoff() {
        let mut config = FeedkeeperConfig::default();
        config.ingest.retry_backoff_ms = MAX_RETRY_BACKOFF_MS;
        assert!(config.validate().is_ok());
        config.ingest.retry_backoff_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(FeedkeeperError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_extension() {
        let mut config = FeedkeeperConfig::default();
        config.storage.media_extension = "../jpg".to_string();
        assert!(config.validate().is_err());
        config.storage.media_extension = ".jpg".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_channels() {
        let mut config = FeedkeeperConfig::default();
        config.channels.names = vec!["Chemed".into(), "Chemed".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Chemed"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = FeedkeeperConfig::default();
        config.channels.names = vec!["EAHCI".to_string()];
        config.save(&path).unwrap();

        let reloaded = FeedkeeperConfig::load(&path).unwrap();
        assert_eq!(reloaded.channels.names, vec!["EAHCI"]);
        assert_eq!(reloaded.retention.media_cap, config.retention.media_cap);
    }

    #[test]
    fn test_expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/var/lib/x"), PathBuf::from("/var/lib/x"));
        assert_eq!(expand_home("relative"), PathBuf::from("relative"));
    }
}

//! CLI argument definitions for the `feedkeeper` binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use feedkeeper_core::config::FeedkeeperConfig;

/// Feedkeeper: ingests channel messages and their media, keeping at most a
/// fixed number of media files per channel.
#[derive(Parser, Debug)]
#[command(name = "feedkeeper", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Data directory for the database and media files.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Directory of channel exports to ingest from.
    #[arg(short = 'r', long = "replay-dir")]
    pub replay_dir: Option<PathBuf>,

    /// Channel to ingest. Repeat for several; replaces the configured list.
    #[arg(long = "channel")]
    pub channels: Vec<String>,

    /// Maximum number of media files kept per channel.
    #[arg(long = "media-cap")]
    pub media_cap: Option<u64>,

    /// Run the history backfill only.
    #[arg(long = "no-live")]
    pub no_live: bool,

    /// Read live messages as JSON lines from stdin.
    #[arg(long = "live-stdin")]
    pub live_stdin: bool,

    /// Print the stored messages of a channel as JSON lines and exit.
    #[arg(long = "list", value_name = "CHANNEL")]
    pub list: Option<String>,

    /// Records to skip when listing.
    #[arg(long = "offset", default_value_t = 0)]
    pub offset: u64,

    /// Records to print when listing.
    #[arg(long = "limit", default_value_t = 50)]
    pub limit: u64,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > FEEDKEEPER_CONFIG env var > ~/.feedkeeper/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("FEEDKEEPER_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Apply command line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut FeedkeeperConfig) {
        if let Some(ref dir) = self.data_dir {
            config.general.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
        if !self.channels.is_empty() {
            config.channels.names = self.channels.clone();
        }
        if let Some(cap) = self.media_cap {
            config.retention.media_cap = cap;
        }
        if self.no_live {
            config.ingest.live = false;
        }
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".feedkeeper").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".feedkeeper").join("config.toml");
    }
    PathBuf::from("config.toml")
}

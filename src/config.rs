//! Hub configuration.

use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hub configuration.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Base directory for the file-system layout.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Events a subscriber may have buffered before it is dropped.
    pub channel_capacity: usize,

    /// Recent messages kept in memory for history reads.
    pub history_cache_size: usize,

    /// Attachment cache size (number of attachments).
    pub attachment_cache_size: usize,

    /// Longest accepted message text, in bytes.
    pub max_text_bytes: usize,

    /// Largest accepted attachment, in bytes.
    pub max_attachment_bytes: usize,

    /// Mime types accepted for uploads. Empty accepts anything.
    pub allowed_mime_types: Vec<String>,

    /// Cap on `limit` for a single history fetch.
    pub max_history_page: usize,

    /// Unreferenced attachments younger than this survive GC.
    pub attachment_gc_grace_secs: u64,

    /// Period of the background GC worker.
    pub attachment_gc_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./murmur-data"),
            create_if_missing: true,
            channel_capacity: 256,
            history_cache_size: 1024,
            attachment_cache_size: 128,
            max_text_bytes: 64 * 1024,
            max_attachment_bytes: 16 * 1024 * 1024,
            allowed_mime_types: vec!["image/png".into(), "image/jpeg".into()],
            max_history_page: 500,
            attachment_gc_grace_secs: 3600,
            attachment_gc_interval_secs: 600,
        }
    }
}

impl HubConfig {
    /// Config rooted at `path`, defaults elsewhere.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: HubConfig =
            serde_json::from_str(raw).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ChatError::Config("channel_capacity must be at least 1".into()));
        }
        if self.max_history_page == 0 {
            return Err(ChatError::Config("max_history_page must be at least 1".into()));
        }
        if self.max_text_bytes == 0 {
            return Err(ChatError::Config("max_text_bytes must be at least 1".into()));
        }
        if self.attachment_gc_interval_secs == 0 {
            return Err(ChatError::Config(
                "attachment_gc_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_secs(self.attachment_gc_grace_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.attachment_gc_interval_secs)
    }
}

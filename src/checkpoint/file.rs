//! Filesystem checkpoint store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::{CheckpointError, CheckpointStore, Result};
use crate::subscription::ReplayToken;

/// On-disk checkpoint document.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    topic: String,
    /// Hex-encoded replay token.
    replay_token: String,
    /// RFC 3339 timestamp of the save.
    saved_at: String,
}

/// Checkpoint store writing one JSON file per topic under a base directory.
pub struct FileCheckpointStore {
    base_path: PathBuf,
}

impl FileCheckpointStore {
    /// Create a new file checkpoint store.
    ///
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    /// File holding the checkpoint for `topic`.
    ///
    /// Topic names contain `/`, so every character outside `[A-Za-z0-9_-]`
    /// is hex-escaped to keep one flat, collision-free directory.
    pub fn path_for_topic(&self, topic: &str) -> PathBuf {
        let mut name = String::with_capacity(topic.len() + 5);
        for c in topic.chars() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push_str(&format!(".{:02x}", byte));
                }
            }
        }
        name.push_str(".json");
        self.base_path.join(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, topic: &str) -> Result<Option<ReplayToken>> {
        let path = self.path_for_topic(topic);
        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let corrupt = |message: String| CheckpointError::Corrupt {
            topic: topic.to_string(),
            message,
        };
        let record: CheckpointRecord =
            serde_json::from_slice(&contents).map_err(|e| corrupt(e.to_string()))?;
        let token =
            ReplayToken::from_hex(&record.replay_token).map_err(|e| corrupt(e.to_string()))?;

        debug!(
            topic = %topic,
            replay_token = %token,
            saved_at = %record.saved_at,
            "Loaded checkpoint"
        );
        Ok(Some(token))
    }

    async fn save(&self, topic: &str, token: &ReplayToken) -> Result<()> {
        let record = CheckpointRecord {
            topic: topic.to_string(),
            replay_token: token.to_hex(),
            saved_at: Utc::now().to_rfc3339(),
        };
        let contents = serde_json::to_vec_pretty(&record).map_err(|e| CheckpointError::Corrupt {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;

        // Write atomically using temp file + rename
        let path = self.path_for_topic(topic);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, contents).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

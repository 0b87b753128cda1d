//! Replay position persistence.
//!
//! The subscription saves the replay token of every dispatched event so a
//! restarted process can resume after the last event it saw. Checkpoint
//! failures never stop a subscription; they are logged and skipped.
//!
//! # Implementations
//!
//! - `MemoryCheckpointStore`: in-process map, lost on restart
//! - `FileCheckpointStore`: one JSON document per topic

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{CheckpointConfig, CheckpointType};
use crate::subscription::ReplayToken;

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while loading or saving checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint for topic '{topic}': {message}")]
    Corrupt { topic: String, message: String },
}

/// Stores the last processed replay token per topic.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last saved token for `topic`, or `None` if nothing was saved.
    async fn load(&self, topic: &str) -> Result<Option<ReplayToken>>;

    /// Record `token` as the last processed position for `topic`.
    async fn save(&self, topic: &str, token: &ReplayToken) -> Result<()>;
}

/// Build the configured checkpoint store, if any.
pub async fn init_checkpoint_store(
    config: &CheckpointConfig,
) -> Result<Option<Arc<dyn CheckpointStore>>> {
    match config.checkpoint_type {
        CheckpointType::None => Ok(None),
        CheckpointType::Memory => {
            info!(checkpoint = "memory", "Checkpoint store initialized");
            Ok(Some(Arc::new(MemoryCheckpointStore::new())))
        }
        CheckpointType::File => {
            let store = FileCheckpointStore::new(&config.path).await?;
            info!(
                checkpoint = "file",
                path = %config.path.display(),
                "Checkpoint store initialized"
            );
            Ok(Some(Arc::new(store)))
        }
    }
}

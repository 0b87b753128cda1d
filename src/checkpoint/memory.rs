//! In-memory checkpoint store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CheckpointStore, Result};
use crate::subscription::ReplayToken;

/// Checkpoint store that keeps positions in memory.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    tokens: RwLock<HashMap<String, ReplayToken>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topics with a saved position.
    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, topic: &str) -> Result<Option<ReplayToken>> {
        Ok(self.tokens.read().await.get(topic).cloned())
    }

    async fn save(&self, topic: &str, token: &ReplayToken) -> Result<()> {
        self.tokens
            .write()
            .await
            .insert(topic.to_string(), token.clone());
        Ok(())
    }
}

//! Subscription, reconnect and checkpoint configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigurationError;
use crate::subscription::{CreditPolicy, ReplayPreset, ReplayToken, SubscriptionRequest};

/// What to subscribe to and from where.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Topic name (required).
    pub topic: String,
    pub replay_preset: ReplayPreset,
    /// Hex-encoded replay token. Required for the `custom` preset.
    pub replay_token: Option<String>,
    /// 0 streams indefinitely.
    pub requested_count: u32,
    pub credit_policy: CreditPolicy,
    /// Look up the topic schema before subscribing.
    pub resolve_schema: bool,
    /// Start from the stored checkpoint when one exists.
    pub resume_from_checkpoint: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            replay_preset: ReplayPreset::Latest,
            replay_token: None,
            requested_count: 0,
            credit_policy: CreditPolicy::Single,
            resolve_schema: true,
            resume_from_checkpoint: false,
        }
    }
}

impl SubscriptionConfig {
    /// Build and validate the subscription request.
    pub fn to_request(&self) -> Result<SubscriptionRequest, ConfigurationError> {
        // The token only matters for custom replay; leftovers are ignored.
        let replay_token = match self.replay_preset {
            ReplayPreset::Custom => self
                .replay_token
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .map(ReplayToken::from_hex)
                .transpose()?,
            ReplayPreset::Latest | ReplayPreset::Earliest => None,
        };

        let request = SubscriptionRequest {
            topic: self.topic.clone(),
            replay_preset: self.replay_preset,
            replay_token,
            requested_count: self.requested_count,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Reconnect behaviour after a retryable mid-stream failure.
///
/// `max_attempts = 0` disables reconnecting: the first transport failure
/// ends the subscription.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            min_delay_ms: 100,
            max_delay_ms: 5000,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    /// Reconnect up to `max_attempts` times with default delays.
    pub fn with_max_attempts(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}

/// Checkpoint store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    /// Replay positions are not stored.
    #[default]
    None,
    /// In-process only; lost on restart.
    Memory,
    /// One JSON file per topic under `path`.
    File,
}

/// Replay position persistence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    #[serde(rename = "type")]
    pub checkpoint_type: CheckpointType,
    /// Directory for the file backend.
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_type: CheckpointType::None,
            path: PathBuf::from("./checkpoints"),
        }
    }
}

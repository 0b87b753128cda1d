//! Subscription request and event envelope types.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::ConfigurationError;
use crate::proto;

/// Where in the bus history a subscription starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPreset {
    /// Only events published after the subscription opens.
    #[default]
    Latest,
    /// The earliest event the bus still retains.
    Earliest,
    /// Resume after a specific [`ReplayToken`].
    Custom,
}

impl From<ReplayPreset> for proto::ReplayPreset {
    fn from(preset: ReplayPreset) -> Self {
        match preset {
            ReplayPreset::Latest => proto::ReplayPreset::Latest,
            ReplayPreset::Earliest => proto::ReplayPreset::Earliest,
            ReplayPreset::Custom => proto::ReplayPreset::Custom,
        }
    }
}

/// Opaque position marker in the bus.
///
/// Textual form (config, logs, checkpoint files) is lowercase hex.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ReplayToken(Bytes);

impl ReplayToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Parse the hex form of a token.
    pub fn from_hex(text: &str) -> Result<Self, ConfigurationError> {
        hex::decode(text.trim())
            .map(Self::new)
            .map_err(|e| ConfigurationError::InvalidReplayToken {
                token: text.to_string(),
                message: e.to_string(),
            })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ReplayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ReplayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplayToken({})", self.to_hex())
    }
}

/// What to subscribe to and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub replay_preset: ReplayPreset,
    /// Required iff `replay_preset` is `Custom`; ignored otherwise.
    pub replay_token: Option<ReplayToken>,
    /// 0 streams indefinitely; otherwise a one-time credit grant.
    pub requested_count: u32,
}

impl SubscriptionRequest {
    /// Open-ended subscription to new events on `topic`.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            replay_preset: ReplayPreset::Latest,
            replay_token: None,
            requested_count: 0,
        }
    }

    pub fn with_preset(mut self, preset: ReplayPreset) -> Self {
        self.replay_preset = preset;
        self
    }

    /// Resume after `token` (sets the preset to `Custom`).
    pub fn resume_after(mut self, token: ReplayToken) -> Self {
        self.replay_preset = ReplayPreset::Custom;
        self.replay_token = Some(token);
        self
    }

    pub fn with_requested_count(mut self, count: u32) -> Self {
        self.requested_count = count;
        self
    }

    /// Check request invariants. Called before any network activity.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigurationError::EmptyTopic);
        }
        if self.replay_preset == ReplayPreset::Custom
            && self.replay_token.as_ref().map_or(true, ReplayToken::is_empty)
        {
            return Err(ConfigurationError::MissingReplayToken);
        }
        if i32::try_from(self.requested_count).is_err() {
            return Err(ConfigurationError::RequestedCountTooLarge(
                self.requested_count,
            ));
        }
        Ok(())
    }

    /// Build the wire request. The token is only sent for `Custom`.
    pub fn to_fetch_request(&self) -> Result<proto::FetchRequest, ConfigurationError> {
        self.validate()?;

        let replay_id = match self.replay_preset {
            ReplayPreset::Custom => self
                .replay_token
                .as_ref()
                .map(|t| t.0.clone())
                .unwrap_or_default(),
            ReplayPreset::Latest | ReplayPreset::Earliest => Bytes::new(),
        };

        Ok(proto::FetchRequest {
            topic_name: self.topic.clone(),
            replay_preset: proto::ReplayPreset::from(self.replay_preset) as i32,
            replay_id,
            num_requested: self.requested_count as i32,
        })
    }
}

/// One event as delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub replay_token: ReplayToken,
    pub event_id: String,
    /// Schema the payload was written with. May be empty.
    pub schema_id: String,
    pub attributes: BTreeMap<String, String>,
    /// Schema-encoded payload.
    pub payload: Bytes,
}

impl From<proto::ConsumerEvent> for EventEnvelope {
    fn from(consumer: proto::ConsumerEvent) -> Self {
        let event = consumer.event.unwrap_or_default();
        let attributes = event
            .headers
            .into_iter()
            .map(|h| (h.key, String::from_utf8_lossy(&h.value).into_owned()))
            .collect();

        Self {
            replay_token: ReplayToken(consumer.replay_id),
            event_id: event.id,
            schema_id: event.schema_id,
            attributes,
            payload: event.payload,
        }
    }
}

/// Events from one network read, in bus order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    pub events: Vec<EventEnvelope>,
    /// Bus position after this batch, also sent on keepalive (empty) batches.
    pub latest_replay_token: ReplayToken,
    /// Credits the server still holds for this call.
    pub pending_requested: u32,
    pub rpc_id: String,
}

impl From<proto::FetchResponse> for EventBatch {
    fn from(response: proto::FetchResponse) -> Self {
        Self {
            events: response
                .events
                .into_iter()
                .map(EventEnvelope::from)
                .collect(),
            latest_replay_token: ReplayToken(response.latest_replay_id),
            pending_requested: u32::try_from(response.pending_num_requested).unwrap_or(0),
            rpc_id: response.rpc_id,
        }
    }
}

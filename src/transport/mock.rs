//! Scripted event source for testing.
//!
//! Each `open_stream` call consumes the next [`MockCall`]. Once the script
//! runs out, calls open and close immediately without delivering anything.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tonic::Status;

use super::{BatchStream, EventSource};
use crate::error::TransportError;
use crate::proto::FetchRequest;
use crate::subscription::{EventBatch, EventEnvelope, ReplayToken};

/// Script for one streaming call.
#[derive(Debug, Default)]
pub struct MockCall {
    open_error: Option<Status>,
    items: Vec<Result<EventBatch, Status>>,
    hang: bool,
}

impl MockCall {
    /// Deliver `batches`, then close.
    pub fn batches(batches: impl IntoIterator<Item = EventBatch>) -> Self {
        Self {
            items: batches.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }

    /// Reject the call before any batch.
    pub fn fail_open(status: Status) -> Self {
        Self {
            open_error: Some(status),
            ..Default::default()
        }
    }

    /// Break the stream with `status` after the scripted batches.
    pub fn then_fail(mut self, status: Status) -> Self {
        self.items.push(Err(status));
        self
    }

    /// Keep the stream open without delivering anything further.
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Event source that replays scripted calls and records every request.
#[derive(Default)]
pub struct MockEventSource {
    calls: Mutex<VecDeque<MockCall>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockEventSource {
    pub fn new(calls: impl IntoIterator<Item = MockCall>) -> Self {
        Self {
            calls: Mutex::new(calls.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in call order.
    pub async fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn open_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn open_stream(&self, request: FetchRequest) -> Result<BatchStream, TransportError> {
        self.requests.lock().await.push(request);
        let call = self.calls.lock().await.pop_front().unwrap_or_default();

        if let Some(status) = call.open_error {
            return Err(TransportError::Open(Box::new(status)));
        }

        let items = stream::iter(
            call.items
                .into_iter()
                .map(|item| item.map_err(|status| TransportError::Stream(Box::new(status)))),
        );
        if call.hang {
            Ok(Box::pin(items.chain(stream::pending())))
        } else {
            Ok(Box::pin(items))
        }
    }
}

/// Event at `token` carrying `payload`, with no schema id or attributes.
pub fn event(token: &[u8], payload: &[u8]) -> EventEnvelope {
    EventEnvelope {
        replay_token: ReplayToken::new(Bytes::copy_from_slice(token)),
        event_id: format!("evt-{}", hex::encode(token)),
        schema_id: String::new(),
        attributes: Default::default(),
        payload: Bytes::copy_from_slice(payload),
    }
}

/// Batch of `events` whose latest token is the last event's token.
pub fn batch(events: Vec<EventEnvelope>) -> EventBatch {
    let latest_replay_token = events
        .last()
        .map(|e| e.replay_token.clone())
        .unwrap_or_default();
    EventBatch {
        events,
        latest_replay_token,
        pending_requested: 0,
        rpc_id: "mock-rpc".to_string(),
    }
}

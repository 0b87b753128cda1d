//! Streaming call abstraction.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::debug;

use super::BusChannel;
use crate::error::TransportError;
use crate::proto::pub_sub_client::PubSubClient;
use crate::proto::FetchRequest;
use crate::subscription::EventBatch;

/// Batches from one open streaming call, in bus order.
///
/// Dropping the stream ends the call.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<EventBatch, TransportError>> + Send>>;

/// Opens server-streaming subscription calls.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open one streaming call for `request`.
    async fn open_stream(&self, request: FetchRequest) -> Result<BatchStream, TransportError>;
}

/// Event source backed by the bus `Subscribe` call.
#[derive(Clone)]
pub struct GrpcEventSource {
    client: PubSubClient<BusChannel>,
}

impl GrpcEventSource {
    pub fn new(channel: BusChannel) -> Self {
        Self {
            client: PubSubClient::new(channel),
        }
    }
}

#[async_trait]
impl EventSource for GrpcEventSource {
    async fn open_stream(&self, request: FetchRequest) -> Result<BatchStream, TransportError> {
        debug!(
            topic = %request.topic_name,
            replay_preset = request.replay_preset,
            num_requested = request.num_requested,
            "Opening subscribe stream"
        );

        let stream = self
            .client
            .clone()
            .subscribe(request)
            .await
            .map_err(|status| TransportError::Open(Box::new(status)))?
            .into_inner();

        Ok(Box::pin(stream.map(|item| {
            item.map(EventBatch::from)
                .map_err(|status| TransportError::Stream(Box::new(status)))
        })))
    }
}

//! Per-event dispatch with failure isolation.
//!
//! Every event is decoded and handed to the caller's handler. Decode errors,
//! handler errors and handler panics are logged with the event's replay
//! token and reported as a [`DispatchOutcome`]; none of them reach the
//! subscription loop. Failed events are not retried or re-queued.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use base64::prelude::*;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error};

use crate::decode::{decode_payload, DecodedFields};
use crate::schema::SchemaCache;
use crate::subscription::{EventEnvelope, ReplayToken};

/// Caller logic failed for one event.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// What the handler receives for each event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Decoded payload, in schema field order.
    pub fields: DecodedFields,
    pub attributes: BTreeMap<String, String>,
    pub replay_token: ReplayToken,
    pub event_id: String,
    pub schema_id: String,
}

/// Caller-supplied per-event logic.
pub trait EventHandler: Send + Sync {
    /// Process one decoded event.
    fn handle(&self, event: DecodedEvent) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as an [`EventHandler`].
///
/// ```ignore
/// let handler = handler_fn(|event: DecodedEvent| async move {
///     println!("{}", event.replay_token);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: DecodedEvent) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin((self.0)(event))
    }
}

/// Result of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded and handled.
    Delivered,
    /// Payload could not be decoded; the handler was not called.
    DecodeFailed,
    /// The handler returned an error or panicked.
    HandlerFailed,
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Decodes events and invokes the handler, one at a time.
pub struct EventDispatcher {
    handler: Arc<dyn EventHandler>,
    schemas: SchemaCache,
}

impl EventDispatcher {
    pub fn new(handler: Arc<dyn EventHandler>, schemas: SchemaCache) -> Self {
        Self { handler, schemas }
    }

    /// Decode `envelope` and run the handler on it. Never fails.
    pub async fn dispatch(&mut self, envelope: EventEnvelope) -> DispatchOutcome {
        let schema = self.schemas.schema_for(&envelope.schema_id).await;

        let fields = match decode_payload(schema.as_deref(), &envelope.payload) {
            Ok(fields) => fields,
            Err(e) => {
                error!(
                    replay_token = %envelope.replay_token,
                    event_id = %envelope.event_id,
                    schema_id = %envelope.schema_id,
                    payload = %BASE64_STANDARD.encode(&envelope.payload),
                    error = %e,
                    "Failed to decode event payload"
                );
                return DispatchOutcome::DecodeFailed;
            }
        };

        let replay_token = envelope.replay_token.clone();
        let event_id = envelope.event_id.clone();
        let event = DecodedEvent {
            fields,
            attributes: envelope.attributes,
            replay_token: envelope.replay_token,
            event_id: envelope.event_id,
            schema_id: envelope.schema_id,
        };

        let handler = &self.handler;
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(future) => future,
            Err(panic) => {
                log_panic(&replay_token, &event_id, panic.as_ref());
                return DispatchOutcome::HandlerFailed;
            }
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(replay_token = %replay_token, event_id = %event_id, "Event handled");
                DispatchOutcome::Delivered
            }
            Ok(Err(e)) => {
                error!(
                    replay_token = %replay_token,
                    event_id = %event_id,
                    error = %e,
                    "Handler failed"
                );
                DispatchOutcome::HandlerFailed
            }
            Err(panic) => {
                log_panic(&replay_token, &event_id, panic.as_ref());
                DispatchOutcome::HandlerFailed
            }
        }
    }
}

fn log_panic(replay_token: &ReplayToken, event_id: &str, panic: &(dyn Any + Send)) {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(
        replay_token = %replay_token,
        event_id = %event_id,
        panic = %message,
        "Handler panicked"
    );
}

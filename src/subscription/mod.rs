//! Subscription stream lifecycle.
//!
//! A [`Subscription`] drives one topic end-to-end:
//! 1. Validate the request (before any network activity)
//! 2. Resolve the topic schema (best-effort)
//! 3. Optionally resume from a stored checkpoint
//! 4. Open the streaming call and dispatch every event in bus order
//!
//! Events are dispatched one at a time; the next batch is not read until
//! every event of the current batch has been handled. Cancellation is
//! observed at the network read and between events. An in-flight handler
//! is never pre-empted.

mod cancel;
mod types;

pub use cancel::{cancellation, CancelHandle, CancelSignal};
pub use types::{EventBatch, EventEnvelope, ReplayPreset, ReplayToken, SubscriptionRequest};

use std::sync::Arc;

use backon::BackoffBuilder;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::ReconnectConfig;
use crate::dispatch::{DispatchOutcome, EventDispatcher, EventHandler};
use crate::error::{SubscriptionError, TransportError};
use crate::proto::FetchRequest;
use crate::schema::{SchemaCache, SchemaRef, SchemaResolver};
use crate::transport::{BatchStream, EventSource};
use crate::utils::retry::reconnect_backoff;

/// What happens when the peer closes a finite-credit call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditPolicy {
    /// One fetch-and-drain call: exhausting the credits ends the subscription.
    #[default]
    Single,
    /// Reopen from the last replay token with a fresh grant of the same size.
    /// A renewed call that delivers nothing ends the subscription.
    Renew,
}

/// How a subscription ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    /// The peer closed the stream.
    Completed,
    /// The caller cancelled.
    Cancelled,
}

/// Final report of a subscription run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSummary {
    pub status: TerminalStatus,
    pub events_received: u64,
    /// Events decoded and handled successfully.
    pub events_handled: u64,
    /// Events whose decode or handler failed.
    pub events_failed: u64,
    /// Replay token of the last dispatched event.
    pub last_replay_token: Option<ReplayToken>,
    /// Streaming calls opened, including renewals and reconnects.
    pub streams_opened: u32,
}

/// How one streaming call ended.
enum CallEnd {
    Closed,
    Cancelled,
    Broken(TransportError),
}

/// Mutable state carried across the calls of one run.
struct RunState {
    topic: String,
    dispatcher: EventDispatcher,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    cancel: CancelSignal,
    /// Resume position for renewals and reconnects.
    position: Option<ReplayToken>,
    events_received: u64,
    events_handled: u64,
    events_failed: u64,
    last_replay_token: Option<ReplayToken>,
    streams_opened: u32,
}

impl RunState {
    fn finish(self, status: TerminalStatus) -> SubscriptionSummary {
        info!(
            topic = %self.topic,
            status = ?status,
            events_received = self.events_received,
            events_failed = self.events_failed,
            "Subscription finished"
        );
        SubscriptionSummary {
            status,
            events_received: self.events_received,
            events_handled: self.events_handled,
            events_failed: self.events_failed,
            last_replay_token: self.last_replay_token,
            streams_opened: self.streams_opened,
        }
    }

    /// Read batches until the call ends. Returns the end reason, the number
    /// of events dispatched and whether any batch arrived.
    async fn drain(&mut self, mut stream: BatchStream) -> (CallEnd, u64, bool) {
        let mut dispatched = 0u64;
        let mut received_batch = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return (CallEnd::Cancelled, dispatched, received_batch);
                }
                next = stream.next() => next,
            };

            let batch = match next {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => return (CallEnd::Broken(e), dispatched, received_batch),
                None => return (CallEnd::Closed, dispatched, received_batch),
            };
            received_batch = true;

            debug!(
                topic = %self.topic,
                rpc_id = %batch.rpc_id,
                events = batch.events.len(),
                pending_requested = batch.pending_requested,
                latest_replay_token = %batch.latest_replay_token,
                "Received batch"
            );

            // Keepalive batches still advance the resume position.
            if batch.events.is_empty() && !batch.latest_replay_token.is_empty() {
                self.position = Some(batch.latest_replay_token);
                continue;
            }

            for envelope in batch.events {
                if self.cancel.is_cancelled() {
                    return (CallEnd::Cancelled, dispatched, received_batch);
                }

                let token = envelope.replay_token.clone();
                self.events_received += 1;
                dispatched += 1;

                match self.dispatcher.dispatch(envelope).await {
                    DispatchOutcome::Delivered => self.events_handled += 1,
                    DispatchOutcome::DecodeFailed | DispatchOutcome::HandlerFailed => {
                        self.events_failed += 1
                    }
                }

                if !token.is_empty() {
                    self.save_checkpoint(&token).await;
                    self.position = Some(token.clone());
                    self.last_replay_token = Some(token);
                }
            }
        }
    }

    async fn save_checkpoint(&self, token: &ReplayToken) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if let Err(e) = store.save(&self.topic, token).await {
            warn!(
                topic = %self.topic,
                replay_token = %token,
                error = %e,
                "Failed to save checkpoint"
            );
        }
    }
}

/// One subscription to one topic.
pub struct Subscription {
    source: Arc<dyn EventSource>,
    request: SubscriptionRequest,
    handler: Arc<dyn EventHandler>,
    resolver: Option<Arc<dyn SchemaResolver>>,
    schema: Option<SchemaRef>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    resume_from_checkpoint: bool,
    credit_policy: CreditPolicy,
    reconnect: ReconnectConfig,
}

impl Subscription {
    pub fn new(
        source: Arc<dyn EventSource>,
        request: SubscriptionRequest,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            source,
            request,
            handler,
            resolver: None,
            schema: None,
            checkpoints: None,
            resume_from_checkpoint: false,
            credit_policy: CreditPolicy::Single,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Look up the topic schema and per-event schemas through `resolver`.
    pub fn with_schema_resolver(mut self, resolver: Arc<dyn SchemaResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use `schema` as the topic schema instead of looking it up.
    pub fn with_schema(mut self, schema: SchemaRef) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Save the replay token of every dispatched event to `store`.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Start after the stored checkpoint when one exists.
    pub fn resume_from_checkpoint(mut self, resume: bool) -> Self {
        self.resume_from_checkpoint = resume;
        self
    }

    pub fn with_credit_policy(mut self, policy: CreditPolicy) -> Self {
        self.credit_policy = policy;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Run until the peer closes the stream, `cancel` fires, or the
    /// transport fails.
    ///
    /// Per-event decode and handler failures are counted in the summary and
    /// never end the run.
    pub async fn run(self, cancel: CancelSignal) -> Result<SubscriptionSummary, SubscriptionError> {
        self.request.validate()?;
        let topic = self.request.topic.clone();

        let mut schemas = SchemaCache::new(self.resolver.clone());
        if let Some(schema) = self.schema.clone() {
            schemas = schemas.with_schema(schema);
        } else {
            schemas.load_topic(&topic).await;
        }

        let request = self.starting_request().await;
        let mut fetch = request.to_fetch_request()?;

        info!(
            topic = %topic,
            replay_preset = ?request.replay_preset,
            replay_token = ?request.replay_token,
            requested_count = request.requested_count,
            credit_policy = ?self.credit_policy,
            "Starting subscription"
        );

        let mut state = RunState {
            topic,
            dispatcher: EventDispatcher::new(self.handler.clone(), schemas),
            checkpoints: self.checkpoints.clone(),
            cancel,
            position: None,
            events_received: 0,
            events_handled: 0,
            events_failed: 0,
            last_replay_token: None,
            streams_opened: 0,
        };

        let backoff = reconnect_backoff(&self.reconnect);
        let mut delays = backoff.build();

        loop {
            if state.cancel.is_cancelled() {
                return Ok(state.finish(TerminalStatus::Cancelled));
            }

            state.streams_opened += 1;
            let opened = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return Ok(state.finish(TerminalStatus::Cancelled)),
                opened = self.source.open_stream(fetch.clone()) => opened,
            };

            let (end, dispatched, received_batch) = match opened {
                Ok(stream) => state.drain(stream).await,
                Err(e) => (CallEnd::Broken(e), 0, false),
            };

            // Progress on this call restores the full reconnect budget.
            if received_batch {
                delays = backoff.build();
            }

            match end {
                CallEnd::Cancelled => return Ok(state.finish(TerminalStatus::Cancelled)),
                CallEnd::Closed => {
                    if self.should_renew(&request, dispatched) {
                        if let Some(next) = self.resume_request(&request, &state)? {
                            info!(
                                topic = %state.topic,
                                replay_token = ?state.position,
                                requested_count = request.requested_count,
                                "Credits exhausted, renewing subscription"
                            );
                            fetch = next;
                            continue;
                        }
                    }
                    info!(topic = %state.topic, "Stream closed by peer");
                    return Ok(state.finish(TerminalStatus::Completed));
                }
                CallEnd::Broken(e) => {
                    if !self.reconnect.is_enabled() || !e.is_retryable() {
                        error!(topic = %state.topic, error = %e, "Subscription failed");
                        return Err(e.into());
                    }
                    let Some(delay) = delays.next() else {
                        error!(
                            topic = %state.topic,
                            error = %e,
                            max_attempts = self.reconnect.max_attempts,
                            "Reconnect attempts exhausted"
                        );
                        return Err(e.into());
                    };

                    warn!(
                        topic = %state.topic,
                        error = %e,
                        delay = ?delay,
                        replay_token = ?state.position,
                        "Stream broke, reconnecting"
                    );
                    tokio::select! {
                        biased;
                        _ = state.cancel.cancelled() => {
                            return Ok(state.finish(TerminalStatus::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Some(next) = self.resume_request(&request, &state)? {
                        fetch = next;
                    }
                }
            }
        }
    }

    /// The configured request, moved to the stored checkpoint if asked to.
    async fn starting_request(&self) -> SubscriptionRequest {
        let request = self.request.clone();
        if !self.resume_from_checkpoint {
            return request;
        }
        let Some(store) = &self.checkpoints else {
            return request;
        };

        match store.load(&request.topic).await {
            Ok(Some(token)) if !token.is_empty() => {
                info!(topic = %request.topic, replay_token = %token, "Resuming from checkpoint");
                request.resume_after(token)
            }
            Ok(_) => {
                debug!(topic = %request.topic, "No checkpoint stored");
                request
            }
            Err(e) => {
                warn!(
                    topic = %request.topic,
                    error = %e,
                    "Failed to load checkpoint, using configured replay position"
                );
                request
            }
        }
    }

    fn should_renew(&self, request: &SubscriptionRequest, dispatched: u64) -> bool {
        self.credit_policy == CreditPolicy::Renew && request.requested_count > 0 && dispatched > 0
    }

    /// Fetch request resuming after the current position, if one is known.
    fn resume_request(
        &self,
        request: &SubscriptionRequest,
        state: &RunState,
    ) -> Result<Option<FetchRequest>, SubscriptionError> {
        let Some(position) = state.position.clone() else {
            return Ok(None);
        };
        let fetch = request.clone().resume_after(position).to_fetch_request()?;
        Ok(Some(fetch))
    }
}

//! Replaybus - replay-capable event bus subscriber
//!
//! Opens a server-streaming subscription against a `PubSub` gRPC endpoint,
//! drains ordered event batches from a configurable replay position and hands
//! each event to caller logic with its Avro payload decoded into a
//! [`decode::DecodedValue`] tree.

pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod schema;
pub mod subscription;
pub mod transport;
pub mod utils;

pub mod proto {
    tonic::include_proto!("eventbus.v1");
}

pub use decode::{DecodedFields, DecodedValue};
pub use dispatch::{handler_fn, DecodedEvent, EventHandler, HandlerError};
pub use error::{ConfigurationError, SubscriptionError, TransportError};
pub use subscription::{
    cancellation, CancelHandle, CancelSignal, CreditPolicy, ReplayPreset, ReplayToken,
    Subscription, SubscriptionRequest, SubscriptionSummary, TerminalStatus,
};

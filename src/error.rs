//! Errors that abort a subscription.
//!
//! Per-event failures (decode, handler) live next to the code that recovers
//! from them: see [`crate::decode::DecodeError`] and
//! [`crate::dispatch::HandlerError`].

use tonic::{Code, Status};

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;

/// Invalid request or configuration. Raised before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("topic name is required")]
    EmptyTopic,

    #[error("replay preset 'custom' requires a non-empty replay token")]
    MissingReplayToken,

    #[error("invalid replay token '{token}': {message}")]
    InvalidReplayToken { token: String, message: String },

    #[error("requested count {0} exceeds the protocol maximum")]
    RequestedCountTooLarge(u32),

    #[error("invalid endpoint '{address}': {message}")]
    InvalidEndpoint { address: String, message: String },

    #[error("invalid header '{name}': {message}")]
    InvalidHeader { name: String, message: String },
}

/// The stream failed to open or broke mid-stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("failed to open stream: {0}")]
    Open(Box<Status>),

    #[error("stream broke: {0}")]
    Stream(Box<Status>),
}

impl TransportError {
    /// Returns the gRPC status code if the peer reported one.
    pub fn code(&self) -> Option<Code> {
        match self {
            TransportError::Open(s) | TransportError::Stream(s) => Some(s.code()),
            _ => None,
        }
    }

    /// Returns true if reconnecting could plausibly succeed.
    ///
    /// Retryable codes:
    /// - `Unavailable`: endpoint restarting or network blip
    /// - `Aborted`: server dropped the stream (e.g. rebalancing)
    /// - `DeadlineExceeded`: idle or long-lived stream timed out
    ///
    /// Connection failures are retryable too; everything else (auth,
    /// invalid argument, not found) will fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection(_) | TransportError::Transport(_) => true,
            _ => matches!(
                self.code(),
                Some(Code::Unavailable | Code::Aborted | Code::DeadlineExceeded)
            ),
        }
    }
}

/// Fatal subscription failure: the `Failed` terminal status.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SubscriptionError {
    /// Returns true if the subscription was rejected before opening a stream.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SubscriptionError::Configuration(_))
    }
}

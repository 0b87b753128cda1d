//! Bootstrap utilities for replaybus binaries.

use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::{EndpointConfig, LOG_ENV_VAR};
use crate::error::SubscriptionError;
use crate::transport::{self, BusChannel};

/// Initialize tracing with the REPLAYBUS_LOG environment variable.
///
/// Defaults to "info" level if REPLAYBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to the bus with exponential backoff retry.
///
/// Configuration errors (bad address, bad header) are returned immediately.
pub async fn connect_with_retry(config: &EndpointConfig) -> Result<BusChannel, SubscriptionError> {
    let channel = (|| transport::connect(config))
        .retry(connection_backoff())
        .when(|e: &SubscriptionError| !e.is_configuration())
        .notify(|e: &SubscriptionError, delay: Duration| {
            warn!(
                address = %config.address,
                error = %e,
                delay = ?delay,
                "Connection failed, retrying"
            );
        })
        .await?;

    info!(address = %config.address, "Connected to event bus");
    Ok(channel)
}

//! replaybus-subscribe: log every event of one topic as JSON
//!
//! ## Usage
//! ```text
//! replaybus-subscribe [config-path]
//! ```
//!
//! ## Configuration
//! - `config.yaml` in the working directory, the path argument, or the file
//!   named by REPLAYBUS_CONFIG
//! - REPLAYBUS__SECTION__KEY environment overrides
//! - REPLAYBUS_LOG: tracing filter (default: info)
//!
//! Ctrl+C cancels the subscription after the in-flight event.

use std::sync::Arc;

use tracing::{error, info};

use replaybus::checkpoint::init_checkpoint_store;
use replaybus::config::Config;
use replaybus::schema::GrpcSchemaResolver;
use replaybus::transport::GrpcEventSource;
use replaybus::utils::bootstrap::{connect_with_retry, init_tracing};
use replaybus::{cancellation, handler_fn, DecodedEvent, HandlerError, Subscription};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    let request = config.subscription.to_request()?;

    let channel = connect_with_retry(&config.endpoint).await?;
    let source = Arc::new(GrpcEventSource::new(channel.clone()));

    let handler = handler_fn(|event: DecodedEvent| async move {
        let fields = serde_json::to_string(&event.fields)
            .map_err(|e| HandlerError::new(format!("fields not serializable: {e}")))?;
        info!(
            replay_token = %event.replay_token,
            event_id = %event.event_id,
            schema_id = %event.schema_id,
            attributes = ?event.attributes,
            fields = %fields,
            "Event"
        );
        Ok::<(), HandlerError>(())
    });

    let mut subscription = Subscription::new(source, request, Arc::new(handler))
        .with_credit_policy(config.subscription.credit_policy)
        .with_reconnect(config.reconnect.clone())
        .resume_from_checkpoint(config.subscription.resume_from_checkpoint);
    if config.subscription.resolve_schema {
        let resolver = GrpcSchemaResolver::new(channel);
        subscription = subscription.with_schema_resolver(Arc::new(resolver));
    }
    if let Some(store) = init_checkpoint_store(&config.checkpoint).await? {
        subscription = subscription.with_checkpoint_store(store);
    }

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            handle.cancel();
        }
    });

    info!(
        topic = %config.subscription.topic,
        address = %config.endpoint.address,
        reconnect_attempts = config.reconnect.max_attempts,
        "replaybus-subscribe started"
    );

    match subscription.run(signal).await {
        Ok(summary) => {
            info!(
                status = ?summary.status,
                events_received = summary.events_received,
                events_handled = summary.events_handled,
                events_failed = summary.events_failed,
                last_replay_token = ?summary.last_replay_token,
                "Subscription ended"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Subscription failed");
            Err(e.into())
        }
    }
}

//! Transport provider for the bus client.
//!
//! Supports:
//! - TCP: `host:port` or `http(s)://host:port`
//! - UDS: paths starting with `/` or `./`, or `unix://` URIs
//!
//! Static metadata (auth tokens, tenant ids) is attached to every outgoing
//! call by [`HeaderInterceptor`], so callers above this layer never touch
//! request headers.

pub mod mock;
mod source;

pub use source::{BatchStream, EventSource, GrpcEventSource};

use std::collections::HashMap;
use std::path::PathBuf;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};
use tower::service_fn;
use tracing::info;

use crate::config::EndpointConfig;
use crate::error::{ConfigurationError, SubscriptionError, TransportError};

/// Channel with header injection, as used by every bus client.
pub type BusChannel = InterceptedService<Channel, HeaderInterceptor>;

/// Attaches a fixed set of metadata entries to every request.
#[derive(Debug, Clone, Default)]
pub struct HeaderInterceptor {
    headers: Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>,
}

impl HeaderInterceptor {
    /// Validate and convert header pairs into gRPC metadata.
    pub fn new(headers: &HashMap<String, String>) -> Result<Self, ConfigurationError> {
        let mut parsed = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            let key = MetadataKey::<Ascii>::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|e| ConfigurationError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            let value = value
                .parse::<MetadataValue<Ascii>>()
                .map_err(|e| ConfigurationError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            parsed.push((key, value));
        }
        Ok(Self { headers: parsed })
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl Interceptor for HeaderInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let metadata = request.metadata_mut();
        for (key, value) in &self.headers {
            metadata.insert(key.clone(), value.clone());
        }
        Ok(request)
    }
}

/// Check if an address is a UDS path.
pub fn is_uds_address(address: &str) -> bool {
    address.starts_with('/') || address.starts_with("./") || address.starts_with("unix://")
}

/// Normalize a TCP address into a URI tonic accepts.
fn tcp_uri(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Connect to the bus endpoint and install header injection.
///
/// Header and address problems are configuration errors and are reported
/// before any connection attempt.
pub async fn connect(config: &EndpointConfig) -> Result<BusChannel, SubscriptionError> {
    let interceptor = HeaderInterceptor::new(&config.headers)?;
    let address = config.address.trim();

    let endpoint = if is_uds_address(address) {
        // The URI is ignored by the UDS connector but tonic requires a valid one
        Endpoint::try_from("http://[::]:50051")
    } else {
        Endpoint::from_shared(tcp_uri(address))
    }
    .map_err(|e| ConfigurationError::InvalidEndpoint {
        address: address.to_string(),
        message: e.to_string(),
    })?;

    let mut endpoint = endpoint.connect_timeout(config.connect_timeout());
    if let Some(interval) = config.keep_alive_interval() {
        endpoint = endpoint
            .http2_keep_alive_interval(interval)
            .keep_alive_while_idle(true);
    }

    let channel = if is_uds_address(address) {
        let socket_path = PathBuf::from(address.strip_prefix("unix://").unwrap_or(address));
        info!(
            path = %socket_path.display(),
            transport = "uds",
            headers = interceptor.len(),
            "Connecting to event bus"
        );

        endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = socket_path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(TransportError::from)?
    } else {
        info!(
            address = %address,
            transport = "tcp",
            headers = interceptor.len(),
            "Connecting to event bus"
        );
        endpoint.connect().await.map_err(TransportError::from)?
    };

    Ok(InterceptedService::new(channel, interceptor))
}

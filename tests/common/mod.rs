//! In-process `PubSub` server for integration tests.
//!
//! Serves an append-only event log with replay semantics close to a real
//! bus: presets pick the start position, `num_requested` bounds each call,
//! and every call can be inspected afterwards (request and metadata).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream, UnixListenerStream};
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use replaybus::proto::pub_sub_server::{PubSub, PubSubServer};
use replaybus::proto::{
    ConsumerEvent, EventHeader, FetchRequest, FetchResponse, ProducerEvent, ReplayPreset,
    SchemaInfo, SchemaRequest, TopicInfo, TopicRequest,
};

/// One RPC as seen by the server.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: &'static str,
    pub fetch: Option<FetchRequest>,
    pub headers: HashMap<String, String>,
}

/// Scriptable in-memory bus.
#[derive(Clone, Default)]
pub struct MockBus {
    log: Arc<Mutex<Vec<ConsumerEvent>>>,
    topics: Arc<Mutex<HashMap<String, String>>>,
    schemas: Arc<Mutex<HashMap<String, String>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    /// Break the next subscribe call with `Unavailable` after this many events.
    break_after: Arc<Mutex<Option<usize>>>,
    /// Keep unbounded calls open after the log is drained.
    hold_open: Arc<Mutex<bool>>,
    batch_size: usize,
}

/// Replay id of the event at `index` in the log.
pub fn replay_id(index: usize) -> Bytes {
    Bytes::copy_from_slice(&(index as u64 + 1).to_be_bytes())
}

impl MockBus {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..Default::default()
        }
    }

    /// Append an event and return its replay id.
    pub async fn publish(&self, schema_id: &str, payload: impl Into<Bytes>) -> Bytes {
        let mut log = self.log.lock().await;
        let n = log.len();
        let id = replay_id(n);
        log.push(ConsumerEvent {
            event: Some(ProducerEvent {
                id: format!("evt-{}", n + 1),
                schema_id: schema_id.to_string(),
                payload: payload.into(),
                headers: vec![EventHeader {
                    key: "origin".to_string(),
                    value: Bytes::from_static(b"mock-bus"),
                }],
            }),
            replay_id: id.clone(),
        });
        id
    }

    pub async fn register_topic(&self, topic: &str, schema_id: &str, schema_json: &str) {
        self.topics
            .lock()
            .await
            .insert(topic.to_string(), schema_id.to_string());
        self.schemas
            .lock()
            .await
            .insert(schema_id.to_string(), schema_json.to_string());
    }

    pub async fn break_next_call_after(&self, events: usize) {
        *self.break_after.lock().await = Some(events);
    }

    pub async fn set_hold_open(&self, hold: bool) {
        *self.hold_open.lock().await = hold;
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn subscribe_calls(&self) -> Vec<FetchRequest> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| c.fetch.clone())
            .collect()
    }

    async fn record(
        &self,
        method: &'static str,
        headers: HashMap<String, String>,
        fetch: Option<FetchRequest>,
    ) {
        self.calls.lock().await.push(RecordedCall {
            method,
            fetch,
            headers,
        });
    }
}

fn ascii_headers(metadata: &MetadataMap) -> HashMap<String, String> {
    metadata
        .iter()
        .filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, value) => value
                .to_str()
                .ok()
                .map(|v| (key.as_str().to_string(), v.to_string())),
            KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

#[tonic::async_trait]
impl PubSub for MockBus {
    type SubscribeStream = Pin<Box<dyn Stream<Item = Result<FetchResponse, Status>> + Send>>;

    async fn subscribe(
        &self,
        request: Request<FetchRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let fetch = request.get_ref().clone();
        self.record("Subscribe", ascii_headers(request.metadata()), Some(fetch.clone()))
            .await;

        let log = self.log.lock().await.clone();
        let start = match ReplayPreset::try_from(fetch.replay_preset) {
            Ok(ReplayPreset::Latest) => log.len(),
            Ok(ReplayPreset::Earliest) => 0,
            Ok(ReplayPreset::Custom) => log
                .iter()
                .position(|e| e.replay_id == fetch.replay_id)
                .map(|i| i + 1)
                .ok_or_else(|| Status::invalid_argument("unknown replay id"))?,
            Err(_) => return Err(Status::invalid_argument("unknown replay preset")),
        };

        let credits = usize::try_from(fetch.num_requested)
            .ok()
            .filter(|n| *n > 0);
        let end = credits.map_or(log.len(), |n| (start + n).min(log.len()));
        let mut events = log[start..end].to_vec();

        let break_after = self.break_after.lock().await.take();
        if let Some(n) = break_after {
            events.truncate(n);
        }
        let hold_open = credits.is_none() && *self.hold_open.lock().await;
        let batch_size = self.batch_size;
        let latest = log.last().map(|e| e.replay_id.clone()).unwrap_or_default();

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut remaining = credits.unwrap_or(0);
            for (n, chunk) in events.chunks(batch_size).enumerate() {
                remaining = remaining.saturating_sub(chunk.len());
                let response = FetchResponse {
                    latest_replay_id: chunk
                        .last()
                        .map(|e| e.replay_id.clone())
                        .unwrap_or_else(|| latest.clone()),
                    events: chunk.to_vec(),
                    rpc_id: format!("rpc-{}", n),
                    pending_num_requested: remaining as i32,
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
            }
            if break_after.is_some() {
                let _ = tx.send(Err(Status::unavailable("bus restarting"))).await;
                return;
            }
            if hold_open {
                tx.closed().await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_topic(
        &self,
        request: Request<TopicRequest>,
    ) -> Result<Response<TopicInfo>, Status> {
        self.record("GetTopic", ascii_headers(request.metadata()), None)
            .await;
        let topic = request.into_inner().topic_name;
        let schema_id = self
            .topics
            .lock()
            .await
            .get(&topic)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("topic {} not found", topic)))?;

        Ok(Response::new(TopicInfo {
            topic_name: topic,
            tenant_guid: "tenant-1".to_string(),
            can_publish: false,
            can_subscribe: true,
            schema_id,
            rpc_id: "rpc-topic".to_string(),
        }))
    }

    async fn get_schema(
        &self,
        request: Request<SchemaRequest>,
    ) -> Result<Response<SchemaInfo>, Status> {
        self.record("GetSchema", ascii_headers(request.metadata()), None)
            .await;
        let schema_id = request.into_inner().schema_id;
        let schema_json = self
            .schemas
            .lock()
            .await
            .get(&schema_id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("schema {} not found", schema_id)))?;

        Ok(Response::new(SchemaInfo {
            schema_json,
            schema_id,
            rpc_id: "rpc-schema".to_string(),
        }))
    }
}

/// Serve `bus` on an ephemeral TCP port. Returns `host:port`.
pub async fn serve_tcp(bus: MockBus) -> (String, tokio::task::JoinHandle<()>) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(PubSubServer::new(bus))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .ok();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("127.0.0.1:{}", port), handle)
}

/// Serve `bus` on a Unix socket at `path`.
pub async fn serve_uds(bus: MockBus, path: &Path) -> tokio::task::JoinHandle<()> {
    let listener = tokio::net::UnixListener::bind(path).unwrap();

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(PubSubServer::new(bus))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
            .ok();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
}

//! End-to-end subscription tests against an in-process bus.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use apache_avro::types::Value as AvroValue;
use apache_avro::{to_avro_datum, Schema};

use common::{replay_id, serve_tcp, serve_uds, MockBus};
use replaybus::checkpoint::{CheckpointStore, FileCheckpointStore};
use replaybus::config::{EndpointConfig, ReconnectConfig};
use replaybus::decode::{NOTE_KEY, RAW_KEY};
use replaybus::schema::GrpcSchemaResolver;
use replaybus::transport::{connect, GrpcEventSource};
use replaybus::{
    cancellation, handler_fn, CancelSignal, CreditPolicy, DecodedEvent, DecodedValue,
    HandlerError, ReplayPreset, ReplayToken, Subscription, SubscriptionError,
    SubscriptionRequest, TerminalStatus,
};

const TOPIC: &str = "/event/Order";
const ORDER_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Order",
    "fields": [
        {"name": "order_id", "type": "string"},
        {"name": "amount", "type": "long"}
    ]
}"#;

type Seen = Arc<Mutex<Vec<DecodedEvent>>>;

fn recording_handler() -> (Seen, impl replaybus::EventHandler) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |event: DecodedEvent| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event);
            Ok::<(), HandlerError>(())
        }
    });
    (seen, handler)
}

fn tokens(seen: &Seen) -> Vec<Vec<u8>> {
    seen.lock()
        .unwrap()
        .iter()
        .map(|e| e.replay_token.as_bytes().to_vec())
        .collect()
}

fn fast_reconnect(max_attempts: usize) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        min_delay_ms: 5,
        max_delay_ms: 20,
        jitter: false,
    }
}

fn order_payload(order_id: &str, amount: i64) -> Vec<u8> {
    let schema = Schema::parse_str(ORDER_SCHEMA).unwrap();
    to_avro_datum(
        &schema,
        AvroValue::Record(vec![
            ("order_id".to_string(), AvroValue::String(order_id.to_string())),
            ("amount".to_string(), AvroValue::Long(amount)),
        ]),
    )
    .unwrap()
}

async fn source_for(address: &str) -> Arc<GrpcEventSource> {
    let channel = connect(&EndpointConfig::new(address)).await.unwrap();
    Arc::new(GrpcEventSource::new(channel))
}

#[tokio::test]
async fn test_avro_events_decoded_with_resolved_schema() {
    let bus = MockBus::new(2);
    bus.register_topic(TOPIC, "order-v1", ORDER_SCHEMA).await;
    bus.publish("order-v1", order_payload("o-1", 120)).await;
    bus.publish("order-v1", order_payload("o-2", 75)).await;
    let (address, _server) = serve_tcp(bus.clone()).await;

    let endpoint = EndpointConfig::new(address.as_str())
        .with_header("Authorization", "Bearer token-1")
        .with_header("tenantid", "acme");
    let channel = connect(&endpoint).await.unwrap();

    let (seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC)
        .with_preset(ReplayPreset::Earliest)
        .with_requested_count(2);
    let summary = Subscription::new(
        Arc::new(GrpcEventSource::new(channel.clone())),
        request,
        Arc::new(handler),
    )
    .with_schema_resolver(Arc::new(GrpcSchemaResolver::new(channel)))
    .run(CancelSignal::never())
    .await
    .unwrap();

    assert_eq!(summary.status, TerminalStatus::Completed);
    assert_eq!(summary.events_handled, 2);

    let seen = seen.lock().unwrap();
    let order_ids: Vec<_> = seen
        .iter()
        .map(|e| e.fields.get("order_id").and_then(DecodedValue::as_str).unwrap().to_string())
        .collect();
    assert_eq!(order_ids, vec!["o-1", "o-2"]);
    assert_eq!(seen[1].fields.get("amount"), Some(&DecodedValue::Int(75)));
    assert_eq!(seen[0].attributes.get("origin").map(String::as_str), Some("mock-bus"));
    drop(seen);

    // Every call, including schema lookups, carries the configured headers.
    let calls = bus.calls().await;
    let methods: Vec<_> = calls.iter().map(|c| c.method).collect();
    assert_eq!(methods, vec!["GetTopic", "GetSchema", "Subscribe"]);
    for call in &calls {
        assert_eq!(call.headers.get("authorization").map(String::as_str), Some("Bearer token-1"));
        assert_eq!(call.headers.get("tenantid").map(String::as_str), Some("acme"));
    }
}

#[tokio::test]
async fn test_schemaless_mixed_payloads_in_order() {
    let bus = MockBus::new(3);
    bus.publish("", &br#"{"a":1}"#[..]).await;
    bus.publish("", &b"not json"[..]).await;
    bus.publish("", &br#"{"b":2}"#[..]).await;
    let (address, _server) = serve_tcp(bus.clone()).await;

    let (seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC)
        .with_preset(ReplayPreset::Earliest)
        .with_requested_count(3);
    let summary = Subscription::new(source_for(&address).await, request, Arc::new(handler))
        .run(CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, TerminalStatus::Completed);
    assert_eq!(summary.events_received, 3);
    assert_eq!(
        tokens(&seen),
        vec![replay_id(0).to_vec(), replay_id(1).to_vec(), replay_id(2).to_vec()]
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].fields.get("a"), Some(&DecodedValue::Int(1)));
    assert!(seen[1].fields.contains_key(RAW_KEY));
    assert!(seen[1].fields.contains_key(NOTE_KEY));
    assert_eq!(seen[2].fields.get("b"), Some(&DecodedValue::Int(2)));

    let fetches = bus.subscribe_calls().await;
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].num_requested, 3);
}

#[tokio::test]
async fn test_custom_preset_resumes_after_token() {
    let bus = MockBus::new(10);
    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(bus.publish("", format!(r#"{{"n":{}}}"#, n).into_bytes()).await);
    }
    let (address, _server) = serve_tcp(bus.clone()).await;

    let (seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC)
        .resume_after(ReplayToken::new(ids[1].clone()))
        .with_requested_count(10);
    Subscription::new(source_for(&address).await, request, Arc::new(handler))
        .run(CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(tokens(&seen), vec![ids[2].to_vec(), ids[3].to_vec()]);
    assert_eq!(bus.subscribe_calls().await[0].replay_id, ids[1]);
}

#[tokio::test]
async fn test_unknown_custom_token_fails() {
    let bus = MockBus::new(10);
    bus.publish("", &b"{}"[..]).await;
    let (address, _server) = serve_tcp(bus).await;

    let (_seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC).resume_after(ReplayToken::new(vec![9u8; 8]));
    let err = Subscription::new(source_for(&address).await, request, Arc::new(handler))
        .run(CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SubscriptionError::Transport(_)));
}

#[tokio::test]
async fn test_renew_policy_pages_through_log() {
    let bus = MockBus::new(2);
    for n in 0..5 {
        bus.publish("", format!(r#"{{"n":{}}}"#, n).into_bytes()).await;
    }
    let (address, _server) = serve_tcp(bus.clone()).await;

    let (seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC)
        .with_preset(ReplayPreset::Earliest)
        .with_requested_count(2);
    let summary = Subscription::new(source_for(&address).await, request, Arc::new(handler))
        .with_credit_policy(CreditPolicy::Renew)
        .run(CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, TerminalStatus::Completed);
    assert_eq!(summary.events_handled, 5);
    assert_eq!(tokens(&seen), (0..5).map(|i| replay_id(i).to_vec()).collect::<Vec<_>>());

    // Pages of 2, 2, 1, then an empty call that ends the run.
    let fetches = bus.subscribe_calls().await;
    assert_eq!(fetches.len(), 4);
    assert!(fetches.iter().all(|f| f.num_requested == 2));
    assert_eq!(fetches[1].replay_id, replay_id(1));
    assert_eq!(fetches[3].replay_id, replay_id(4));
}

#[tokio::test]
async fn test_reconnect_after_unavailable_without_duplicates() {
    let bus = MockBus::new(1);
    for n in 0..5 {
        bus.publish("", format!(r#"{{"n":{}}}"#, n).into_bytes()).await;
    }
    bus.break_next_call_after(2).await;
    let (address, _server) = serve_tcp(bus.clone()).await;

    let (seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC).with_preset(ReplayPreset::Earliest);
    let summary = Subscription::new(source_for(&address).await, request, Arc::new(handler))
        .with_reconnect(fast_reconnect(3))
        .run(CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, TerminalStatus::Completed);
    assert_eq!(summary.streams_opened, 2);
    assert_eq!(tokens(&seen), (0..5).map(|i| replay_id(i).to_vec()).collect::<Vec<_>>());

    let fetches = bus.subscribe_calls().await;
    assert_eq!(fetches[1].replay_id, replay_id(1));
}

#[tokio::test]
async fn test_unavailable_without_reconnect_fails() {
    let bus = MockBus::new(1);
    for n in 0..3 {
        bus.publish("", format!(r#"{{"n":{}}}"#, n).into_bytes()).await;
    }
    bus.break_next_call_after(1).await;
    let (address, _server) = serve_tcp(bus.clone()).await;

    let (seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC).with_preset(ReplayPreset::Earliest);
    let err = Subscription::new(source_for(&address).await, request, Arc::new(handler))
        .run(CancelSignal::never())
        .await
        .unwrap_err();

    match err {
        SubscriptionError::Transport(e) => assert!(e.is_retryable()),
        other => panic!("expected transport error, got {other}"),
    }
    // The event before the break was still delivered.
    assert_eq!(tokens(&seen), vec![replay_id(0).to_vec()]);
    assert_eq!(bus.subscribe_calls().await.len(), 1);
}

#[tokio::test]
async fn test_cancel_ends_open_ended_stream() {
    let bus = MockBus::new(10);
    bus.publish("", &b"{}"[..]).await;
    bus.set_hold_open(true).await;
    let (address, _server) = serve_tcp(bus).await;

    let (seen, handler) = recording_handler();
    let (cancel, signal) = cancellation();
    let request = SubscriptionRequest::new(TOPIC).with_preset(ReplayPreset::Earliest);
    let run = tokio::spawn(
        Subscription::new(source_for(&address).await, request, Arc::new(handler)).run(signal),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("subscription did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(summary.status, TerminalStatus::Cancelled);
    assert_eq!(summary.events_handled, 1);
    assert_eq!(tokens(&seen).len(), 1);
}

#[tokio::test]
async fn test_subscribe_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("bus.sock");

    let bus = MockBus::new(10);
    bus.publish("", &br#"{"via":"uds"}"#[..]).await;
    let _server = serve_uds(bus, &socket).await;

    let (seen, handler) = recording_handler();
    let request = SubscriptionRequest::new(TOPIC)
        .with_preset(ReplayPreset::Earliest)
        .with_requested_count(1);
    let summary = Subscription::new(
        source_for(socket.to_str().unwrap()).await,
        request,
        Arc::new(handler),
    )
    .run(CancelSignal::never())
    .await
    .unwrap();

    assert_eq!(summary.events_handled, 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].fields.get("via").and_then(DecodedValue::as_str), Some("uds"));
}

#[tokio::test]
async fn test_file_checkpoint_resumes_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new(10);
    for n in 0..5 {
        bus.publish("", format!(r#"{{"n":{}}}"#, n).into_bytes()).await;
    }
    let (address, _server) = serve_tcp(bus.clone()).await;

    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(dir.path()).await.unwrap());
    let request = SubscriptionRequest::new(TOPIC).with_preset(ReplayPreset::Earliest);

    let (first, handler) = recording_handler();
    Subscription::new(
        source_for(&address).await,
        request.clone().with_requested_count(2),
        Arc::new(handler),
    )
    .with_checkpoint_store(store.clone())
    .resume_from_checkpoint(true)
    .run(CancelSignal::never())
    .await
    .unwrap();
    assert_eq!(tokens(&first).len(), 2);
    assert_eq!(
        store.load(TOPIC).await.unwrap(),
        Some(ReplayToken::new(replay_id(1)))
    );

    // A fresh store over the same directory sees the saved position.
    let reopened: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(dir.path()).await.unwrap());
    let (second, handler) = recording_handler();
    Subscription::new(source_for(&address).await, request, Arc::new(handler))
        .with_checkpoint_store(reopened)
        .resume_from_checkpoint(true)
        .run(CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(
        tokens(&second),
        (2..5).map(|i| replay_id(i).to_vec()).collect::<Vec<_>>()
    );
    let fetches = bus.subscribe_calls().await;
    assert_eq!(fetches[1].replay_id, replay_id(1));
}

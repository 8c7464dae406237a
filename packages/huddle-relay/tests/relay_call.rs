//! End-to-end tests: a relay on a loopback port, clients on `RemoteStore`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use huddle_core::store::{CollectionPath, Document, DocumentPath, SignalingStore};
use huddle_core::testing::{wait_until, FakeMediaDevices, LoopbackTransportFactory};
use huddle_core::{
    CallConfig, CallManager, CallMode, ControllerState, Error, ParticipantId, RemoteStore, Role,
};
use huddle_relay::state::{RelayConfig, RelayState};

async fn spawn_relay() -> (String, RelayState) {
    let state = RelayState::new(RelayConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = huddle_relay::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), state)
}

async fn connect(addr: &str) -> RemoteStore {
    RemoteStore::connect(&format!("ws://{}/ws", addr)).await.unwrap()
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn client(store: RemoteStore) -> CallManager {
    CallManager::new(
        Arc::new(store),
        Arc::new(FakeMediaDevices::granting()),
        Arc::new(LoopbackTransportFactory::new()),
        CallConfig::default(),
    )
}

async fn wait_for_state(manager: &CallManager, state: ControllerState) {
    for _ in 0..400 {
        if manager.snapshot().await.state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("manager never reached {:?}", state);
}

#[tokio::test]
async fn test_health_and_stats_endpoints() {
    let (addr, _state) = spawn_relay().await;

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "huddle-relay");

    let _store = connect(&addr).await;
    let stats: serde_json::Value = reqwest::get(format!("http://{}/stats", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["online_clients"], 1);
}

#[tokio::test]
async fn test_store_operations_over_the_wire() {
    let (addr, state) = spawn_relay().await;
    let store = connect(&addr).await;
    let session = DocumentPath::new("calls/alice_bob").unwrap();

    assert_eq!(store.get_document(&session).await.unwrap(), None);
    assert!(store
        .create_document(&session, doc(json!({"callerId": "alice"})))
        .await
        .unwrap());
    assert!(!store
        .create_document(&session, doc(json!({"callerId": "bob"})))
        .await
        .unwrap());

    store
        .update_document(&session, doc(json!({"answer": {"type": "answer", "sdp": "x"}})))
        .await
        .unwrap();
    let read = store.get_document(&session).await.unwrap().unwrap();
    assert_eq!(read["callerId"], "alice");
    assert_eq!(read["answer"]["sdp"], "x");

    let candidates = session.collection("callerCandidates");
    let id = store
        .add_to_collection(&candidates, doc(json!({"candidate": "c1"})))
        .await
        .unwrap();
    let entries = store.list_collection(&candidates).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);

    // The relay's own copy is what other clients read
    assert_eq!(state.store.document_count(), 2);

    store.delete_document(&session).await.unwrap();
    assert_eq!(store.get_document(&session).await.unwrap(), None);
}

#[tokio::test]
async fn test_update_of_missing_document_keeps_its_error() {
    let (addr, _state) = spawn_relay().await;
    let store = connect(&addr).await;
    let session = DocumentPath::new("calls/nobody_here").unwrap();

    let err = store
        .update_document(&session, doc(json!({"x": 1})))
        .await
        .unwrap_err();
    assert_eq!(err, Error::DocumentNotFound(session.to_string()));
}

#[tokio::test]
async fn test_subscriptions_span_clients() {
    let (addr, _state) = spawn_relay().await;
    let writer = connect(&addr).await;
    let watcher = connect(&addr).await;

    let session = DocumentPath::new("calls/alice_bob").unwrap();
    let candidates = CollectionPath::new("calls/alice_bob/calleeCandidates").unwrap();

    let mut doc_sub = watcher.subscribe_document(&session).await.unwrap();
    let mut col_sub = watcher.subscribe_collection(&candidates).await.unwrap();
    assert_eq!(doc_sub.recv().await, Some(None));

    writer
        .set_document(&session, doc(json!({"callerId": "alice"})))
        .await
        .unwrap();
    let snapshot = doc_sub.recv().await.unwrap().unwrap();
    assert_eq!(snapshot["callerId"], "alice");

    writer
        .add_to_collection(&candidates, doc(json!({"candidate": "c1"})))
        .await
        .unwrap();
    let entry = col_sub.recv().await.unwrap();
    assert_eq!(entry.data["candidate"], "c1");

    writer.delete_document(&session).await.unwrap();
    assert_eq!(doc_sub.recv().await, Some(None));
}

#[tokio::test]
async fn test_unsubscribe_and_disconnect_release_relay_subscriptions() {
    let (addr, state) = spawn_relay().await;
    let session = DocumentPath::new("calls/alice_bob").unwrap();

    let store = connect(&addr).await;
    let first = store.subscribe_document(&session).await.unwrap();
    let _second = store.subscribe_document(&session).await.unwrap();
    assert_eq!(state.subscription_count(), 2);

    first.unsubscribe();
    let counts = state.clone();
    wait_until(move || counts.subscription_count() == 1).await;

    drop(_second);
    drop(store);
    let counts = state.clone();
    wait_until(move || counts.online_count() == 0 && counts.subscription_count() == 0).await;
}

#[tokio::test]
async fn test_full_call_through_relay() {
    let (addr, state) = spawn_relay().await;
    let alice_id = ParticipantId::new("alice").unwrap();
    let bob_id = ParticipantId::new("bob").unwrap();

    let alice = client(connect(&addr).await);
    let bob = client(connect(&addr).await);

    let call_id = alice
        .begin_call(CallMode::Video, &alice_id, &bob_id)
        .await
        .unwrap();
    assert_eq!(call_id.as_str(), "alice_bob");
    assert_eq!(alice.snapshot().await.role, Some(Role::Caller));

    let joined = bob
        .begin_call(CallMode::Video, &bob_id, &alice_id)
        .await
        .unwrap();
    assert_eq!(joined, call_id);
    assert_eq!(bob.snapshot().await.role, Some(Role::Callee));

    wait_for_state(&alice, ControllerState::Connected).await;
    wait_for_state(&bob, ControllerState::Connected).await;
    assert!(bob.snapshot().await.remote_stream.is_some());

    alice.end_call().await.unwrap();
    wait_for_state(&bob, ControllerState::Closed).await;

    let relay = state.clone();
    wait_until(move || relay.store.document_count() == 0).await;
}

//! End-to-end tests: client requester -> client handler -> server channel ->
//! client handler registry -> backend, over in-memory channel pairs.

use conduit_core::messaging::encode_call;
use conduit_core::permissions::{
    ManagedRegistry, MemoryDecisionStore, PromptRequest, TrustedClientsRegistry, UserPrompt,
    UserPromptingChecker,
};
use conduit_core::{
    announce_ready, ClientHandler, ClientHandlerRegistry, ConduitError, MessageChannel,
    MessageChannelPair, PermissionCache, PolicyOrPromptingChecker, ReadinessTracker,
    RemoteCallDispatch, RemoteCallMessage, Requester, Result, ServerConnection,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[derive(Default)]
struct EchoBackend {
    created: Mutex<Vec<(u64, String)>>,
    deleted: Mutex<Vec<u64>>,
}

#[async_trait::async_trait]
impl RemoteCallDispatch for EchoBackend {
    async fn dispatch(&self, _handler_id: u64, call: RemoteCallMessage) -> Result<Value> {
        match call.function_name.as_str() {
            "echo" => Ok(Value::Array(call.arguments)),
            "fail" => Err(ConduitError::remote("the call failed")),
            other => Err(ConduitError::remote(format!("unknown function {}", other))),
        }
    }

    async fn on_handler_created(&self, handler_id: u64, client_name_for_log: &str) {
        self.created
            .lock()
            .unwrap()
            .push((handler_id, client_name_for_log.to_string()));
    }

    async fn on_handler_deleted(&self, handler_id: u64) {
        self.deleted.lock().unwrap().push(handler_id);
    }
}

/// Always answers the prompt with a fixed decision.
struct FixedPrompt(bool);

#[async_trait::async_trait]
impl UserPrompt for FixedPrompt {
    async fn prompt(&self, _request: PromptRequest) -> Result<bool> {
        Ok(self.0)
    }
}

struct Setup {
    server_app_end: Arc<dyn MessageChannel>,
    backend: Arc<EchoBackend>,
    registry: ClientHandlerRegistry,
    _tracker: ReadinessTracker,
    connection: ServerConnection,
    checker: Arc<PolicyOrPromptingChecker>,
}

fn setup(allowed: &[&str], prompt_answer: bool) -> Setup {
    let (app_end, server_end) = MessageChannelPair::new("server");
    let server_app_end: Arc<dyn MessageChannel> = app_end;
    let server_end: Arc<dyn MessageChannel> = server_end;

    let tracker = ReadinessTracker::new(Arc::clone(&server_app_end));
    let backend = Arc::new(EchoBackend::default());
    let registry = ClientHandlerRegistry::new(Arc::clone(&server_end), backend.clone());
    announce_ready(server_end.as_ref()).unwrap();

    let user = UserPromptingChecker::new(
        Arc::new(TrustedClientsRegistry::new()),
        Arc::new(MemoryDecisionStore::new()),
        Arc::new(FixedPrompt(prompt_answer)),
    );
    let checker = Arc::new(PolicyOrPromptingChecker::new(
        Arc::new(PermissionCache::new()),
        Arc::new(ManagedRegistry::with_origins(allowed.iter().copied())),
        Arc::new(user),
    ));

    Setup {
        connection: ServerConnection::new(Arc::clone(&server_app_end), tracker.signal()),
        server_app_end,
        backend,
        registry,
        _tracker: tracker,
        checker,
    }
}

fn connect_client(setup: &Setup, origin: &str) -> (Requester, ClientHandler, Arc<dyn MessageChannel>) {
    let (client_end, handler_end) = MessageChannelPair::new(origin);
    let client_end: Arc<dyn MessageChannel> = client_end;
    let handler = ClientHandler::new(
        &setup.connection,
        handler_end,
        Some(origin.to_string()),
        setup.checker.clone(),
    );
    let requester = Requester::new("conduit", Arc::clone(&client_end));
    (requester, handler, client_end)
}

#[tokio::test]
async fn test_granted_client_round_trip() {
    let setup = setup(&["https://a.example"], false);
    let (requester, handler, _client) = connect_client(&setup, "https://a.example");

    let reply = requester
        .post_request(encode_call("echo", vec![json!(1), json!("two")]))
        .await
        .unwrap();
    assert_eq!(reply, json!([1, "two"]));

    let failure = requester
        .post_request(encode_call("fail", vec![]))
        .await
        .unwrap_err();
    assert_eq!(failure, ConduitError::remote("the call failed"));

    settle().await;
    assert_eq!(setup.registry.handler_ids(), vec![handler.id()]);
    assert_eq!(
        *setup.backend.created.lock().unwrap(),
        vec![(handler.id(), "a.example".to_string())]
    );
}

#[tokio::test]
async fn test_requests_are_answered_in_order_per_client() {
    let setup = setup(&["https://a.example"], false);
    let (requester, _handler, _client) = connect_client(&setup, "https://a.example");

    let replies: Vec<_> = (0..5)
        .map(|i| requester.post_request(encode_call("echo", vec![json!(i)])))
        .collect();
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.await.unwrap(), json!([i]));
    }
}

#[tokio::test]
async fn test_prompt_grants_unlisted_client() {
    let setup = setup(&[], true);
    let (requester, _handler, _client) = connect_client(&setup, "https://b.example");

    let reply = requester
        .post_request(encode_call("echo", vec![json!(true)]))
        .await
        .unwrap();
    assert_eq!(reply, json!([true]));
}

#[tokio::test]
async fn test_denied_client_never_reaches_server() {
    let setup = setup(&[], false);
    let (requester, _handler, _client) = connect_client(&setup, "https://evil.example");

    let error = requester
        .post_request(encode_call("echo", vec![json!(1)]))
        .await
        .unwrap_err();
    match error {
        ConduitError::Remote { message } => assert!(message.contains("Permission denied")),
        other => panic!("unexpected error: {:?}", other),
    }

    // Later requests are rejected without a second check.
    assert!(requester
        .post_request(encode_call("echo", vec![]))
        .await
        .is_err());
    assert_eq!(setup.registry.handler_count(), 0);
    assert!(setup.backend.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_client_disconnect_deletes_handler_on_server() {
    let setup = setup(&["https://a.example"], false);
    let (requester, handler, client) = connect_client(&setup, "https://a.example");

    requester
        .post_request(encode_call("echo", vec![]))
        .await
        .unwrap();
    assert_eq!(setup.registry.handler_count(), 1);

    client.dispose();
    settle().await;

    assert!(handler.is_disposed());
    assert_eq!(setup.registry.handler_count(), 0);
    assert_eq!(*setup.backend.deleted.lock().unwrap(), vec![handler.id()]);
}

#[tokio::test]
async fn test_server_disconnect_disposes_clients() {
    let setup = setup(&["https://a.example", "https://b.example"], false);
    let (requester_a, handler_a, client_a) = connect_client(&setup, "https://a.example");
    let (requester_b, handler_b, client_b) = connect_client(&setup, "https://b.example");

    requester_a.post_request(encode_call("echo", vec![])).await.unwrap();
    requester_b.post_request(encode_call("echo", vec![])).await.unwrap();

    setup.server_app_end.dispose();
    settle().await;

    assert!(handler_a.is_disposed());
    assert!(handler_b.is_disposed());
    assert!(client_a.is_disposed());
    assert!(client_b.is_disposed());
    assert!(requester_a
        .post_request(encode_call("echo", vec![]))
        .await
        .unwrap_err()
        .is_disposal());
}

#[tokio::test]
async fn test_clients_are_isolated() {
    let setup = setup(&["https://a.example"], false);
    let (requester_a, _handler_a, _client_a) = connect_client(&setup, "https://a.example");
    let (_requester_b, handler_b, client_b) = connect_client(&setup, "https://b.example");

    // A protocol violation by one client only tears down that client.
    client_b.send("conduit::request", json!({"request_id": 0, "payload": "garbage"})).unwrap();
    settle().await;
    assert!(handler_b.is_disposed());

    let reply = requester_a
        .post_request(encode_call("echo", vec![json!("still here")]))
        .await
        .unwrap();
    assert_eq!(reply, json!(["still here"]));
}

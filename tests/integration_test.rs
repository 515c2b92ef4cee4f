use futures::StreamExt;
use portkey_callback::error::TIMEOUT_ERROR;
use portkey_callback::pubsub::{MessageHandler, SubscriptionHandle, callback_topic};
use portkey_callback::subscription_registry::SubscriptionState;
use portkey_callback::{
    CALLBACK_ACCEPT, CallbackConfig, ExecutionContext, GraphQLRequest, HttpCallbackExecutor,
    InMemoryPubSub, PubSub, ResultStream, TransportError,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// In-process bus that counts unsubscribe calls
#[derive(Default)]
struct CountingPubSub {
    bus: InMemoryPubSub,
    unsubscribes: AtomicUsize,
}

impl PubSub for CountingPubSub {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> SubscriptionHandle {
        self.bus.subscribe(topic, handler)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.bus.unsubscribe(handle);
    }

    fn publish(&self, topic: &str, message: Value) -> usize {
        self.bus.publish(topic, message)
    }
}

// Test fixture: a mocked subgraph plus an executor pointed at it
struct TestFixture {
    _server: mockito::ServerGuard,
    _mock: mockito::Mock,
    pubsub: Arc<CountingPubSub>,
    executor: HttpCallbackExecutor,
    captured: Arc<Mutex<Vec<Value>>>,
}

impl TestFixture {
    async fn setup(heartbeat_interval: u64, status: usize, response: Value) -> Self {
        let config = CallbackConfig {
            public_url: "http://gateway.test/callback".to_string(),
            heartbeat_interval,
            ..CallbackConfig::default()
        };
        TestFixture::setup_with(config, status, response, None).await
    }

    async fn setup_with(
        config: CallbackConfig,
        status: usize,
        response: Value,
        expected_header: Option<(&str, &str)>,
    ) -> Self {
        let mut server = mockito::Server::new_async().await;
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let body = response.to_string();

        let mut mock = server
            .mock("POST", "/graphql")
            .match_header("accept", CALLBACK_ACCEPT)
            .with_status(status)
            .with_header("content-type", "application/json");
        if let Some((name, value)) = expected_header {
            mock = mock.match_header(name, value);
        }
        let mock = mock
            .with_body_from_request(move |request| {
                if let Ok(bytes) = request.body() {
                    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                        sink.lock().unwrap().push(value);
                    }
                }
                body.clone().into_bytes()
            })
            .create_async()
            .await;

        let pubsub = Arc::new(CountingPubSub::default());
        let executor = HttpCallbackExecutor::new(
            format!("{}/graphql", server.url()),
            config,
            pubsub.clone(),
        );

        TestFixture {
            _server: server,
            _mock: mock,
            pubsub,
            executor,
            captured,
        }
    }

    fn subscribe(&self) -> ResultStream {
        self.subscribe_with(ExecutionContext::default())
    }

    fn subscribe_with(&self, context: ExecutionContext) -> ResultStream {
        let request = GraphQLRequest {
            query: "subscription OnFoo { foo }".to_string(),
            variables: Some(json!({ "limit": 3 })),
            operation_name: Some("OnFoo".to_string()),
            extensions: Default::default(),
        };
        self.executor.subscribe(request, &context)
    }

    // Wait until the subgraph saw the initiating request for `id`
    async fn initiating_request(&self, id: &str) -> Value {
        for _ in 0..500 {
            let found = self
                .captured
                .lock()
                .unwrap()
                .iter()
                .find(|body| body["extensions"]["subscription"]["subscriptionId"] == id)
                .cloned();
            if let Some(body) = found {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subgraph never received the initiating request for {}", id);
    }

    // Wait until the initiating response has been handled
    async fn wait_active(&self, id: &str) {
        for _ in 0..500 {
            if self.executor.subscription_state(id) == Some(SubscriptionState::Active) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscription {} never became active", id);
    }

    async fn verifier(&self, id: &str) -> String {
        let body = self.initiating_request(id).await;
        body["extensions"]["subscription"]["verifier"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn callback(&self, id: &str, verifier: &str, action: &str, extra: Value) -> usize {
        let mut message = json!({
            "kind": "subscription",
            "action": action,
            "id": id,
            "verifier": verifier,
        });
        if let (Value::Object(message), Value::Object(extra)) = (&mut message, extra) {
            message.extend(extra);
        }
        self.pubsub.publish(&callback_topic("/callback", id), message)
    }

    fn unsubscribes(&self) -> usize {
        self.pubsub.unsubscribes.load(Ordering::SeqCst)
    }
}

async fn next_item(stream: &mut ResultStream) -> Option<Result<Value, TransportError>> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream did not produce an item in time")
}

#[tokio::test]
async fn test_inline_data_yields_once_and_ends() {
    let fixture = TestFixture::setup(5_000, 200, json!({ "data": { "foo": 1 } })).await;
    let mut stream = fixture.subscribe();

    let first = next_item(&mut stream).await.unwrap().unwrap();
    assert_eq!(first, json!({ "foo": 1 }));
    assert!(next_item(&mut stream).await.is_none());
    drop(stream);

    assert_eq!(fixture.executor.active_subscriptions(), 0);
    assert_eq!(fixture.executor.armed_heartbeats(), 0);
    assert_eq!(fixture.unsubscribes(), 1);
}

#[tokio::test]
async fn test_initiating_request_carries_callback_extension() {
    let fixture = TestFixture::setup(5_000, 200, json!({})).await;
    let stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();

    let body = fixture.initiating_request(&id).await;
    assert_eq!(body["query"], "subscription OnFoo { foo }");
    assert_eq!(body["variables"], json!({ "limit": 3 }));
    assert_eq!(body["operationName"], "OnFoo");
    let subscription = &body["extensions"]["subscription"];
    assert_eq!(
        subscription["callbackUrl"],
        format!("http://gateway.test/callback/{}", id)
    );
    assert_eq!(subscription["heartbeatIntervalMs"], 5_000);
    assert!(subscription["verifier"].as_str().is_some_and(|v| !v.is_empty()));

    // Same verifier for every subscription of one transport
    let other = fixture.subscribe();
    let other_verifier = fixture.verifier(other.subscription_id()).await;
    assert_eq!(subscription["verifier"], other_verifier);
}

#[tokio::test]
async fn test_callbacks_feed_the_stream_until_complete() {
    let fixture = TestFixture::setup(5_000, 200, json!({})).await;
    let mut stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();
    let verifier = fixture.verifier(&id).await;

    assert_eq!(
        fixture.callback(&id, &verifier, "next", json!({ "payload": { "foo": 2 } })),
        1
    );
    assert_eq!(next_item(&mut stream).await.unwrap().unwrap(), json!({ "foo": 2 }));

    fixture.callback(&id, &verifier, "next", json!({ "payload": { "foo": 3 } }));
    fixture.callback(&id, &verifier, "complete", json!({}));
    assert_eq!(next_item(&mut stream).await.unwrap().unwrap(), json!({ "foo": 3 }));
    assert!(next_item(&mut stream).await.is_none());

    // Nobody listens on the callback path any more
    assert_eq!(fixture.callback(&id, &verifier, "check", json!({})), 0);
    drop(stream);
    assert_eq!(fixture.unsubscribes(), 1);
    assert_eq!(fixture.executor.armed_heartbeats(), 0);
}

#[tokio::test]
async fn test_missing_heartbeat_times_out() {
    let fixture = TestFixture::setup(200, 200, json!({})).await;
    let mut stream = fixture.subscribe();

    let error = next_item(&mut stream).await.unwrap().unwrap_err();
    assert!(matches!(error, TransportError::Timeout { interval_ms: 200 }));
    assert_eq!(error.code(), Some(TIMEOUT_ERROR));
    assert!(next_item(&mut stream).await.is_none());
    drop(stream);

    assert_eq!(fixture.executor.active_subscriptions(), 0);
    assert_eq!(fixture.unsubscribes(), 1);
}

#[tokio::test]
async fn test_check_messages_keep_subscription_alive() {
    let fixture = TestFixture::setup(300, 200, json!({})).await;
    let mut stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();
    let verifier = fixture.verifier(&id).await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fixture.callback(&id, &verifier, "check", json!({})), 1);
    }
    assert_eq!(
        fixture.executor.subscription_state(&id),
        Some(SubscriptionState::Active)
    );

    fixture.callback(&id, &verifier, "complete", json!({}));
    assert!(next_item(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_complete_with_errors_is_aggregated() {
    let fixture = TestFixture::setup(5_000, 200, json!({})).await;
    let mut stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();
    let verifier = fixture.verifier(&id).await;

    fixture.callback(
        &id,
        &verifier,
        "complete",
        json!({ "errors": [{ "message": "first failure" }, { "message": "second failure" }] }),
    );

    let error = next_item(&mut stream).await.unwrap().unwrap_err();
    match &error {
        TransportError::Aggregate(errors) => assert_eq!(errors.len(), 2),
        other => panic!("expected aggregate error, got {:?}", other),
    }
    let message = error.to_string();
    assert!(message.contains("first failure"));
    assert!(message.contains("second failure"));
    assert!(next_item(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_forged_verifier_is_ignored() {
    let fixture = TestFixture::setup(400, 200, json!({})).await;
    let mut stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();
    fixture.wait_active(&id).await;
    let armed = fixture.executor.heartbeat_generation(&id);
    assert!(armed.is_some());

    fixture.callback(&id, "forged", "check", json!({}));
    fixture.callback(&id, "forged", "next", json!({ "payload": { "foo": 2 } }));
    fixture.callback(&id, "forged", "complete", json!({}));
    assert_eq!(
        fixture.executor.subscription_state(&id),
        Some(SubscriptionState::Active)
    );
    assert_eq!(fixture.executor.heartbeat_generation(&id), armed);

    // Nothing was yielded and nothing refreshed the heartbeat
    let error = next_item(&mut stream).await.unwrap().unwrap_err();
    assert!(matches!(error, TransportError::Timeout { .. }));
}

#[tokio::test]
async fn test_complete_with_loose_errors_ends_subscription() {
    let fixture = TestFixture::setup(5_000, 200, json!({})).await;

    let mut stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();
    let verifier = fixture.verifier(&id).await;
    fixture.callback(&id, &verifier, "complete", json!({ "errors": null }));
    assert!(next_item(&mut stream).await.is_none());

    let mut stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();
    fixture.callback(&id, &verifier, "complete", json!({ "errors": [{ "msg": "boom" }] }));
    let error = next_item(&mut stream).await.unwrap().unwrap_err();
    assert!(matches!(error, TransportError::Remote(_)));
    assert!(next_item(&mut stream).await.is_none());

    assert_eq!(fixture.executor.active_subscriptions(), 0);
    assert_eq!(fixture.executor.armed_heartbeats(), 0);
}

#[tokio::test]
async fn test_initiating_http_failure_ends_stream() {
    let fixture = TestFixture::setup(5_000, 500, json!("subgraph exploded")).await;
    let mut stream = fixture.subscribe();

    let error = next_item(&mut stream).await.unwrap().unwrap_err();
    match &error {
        TransportError::Http { status, body } => {
            assert_eq!(*status, 500);
            assert!(body.contains("subgraph exploded"));
        }
        other => panic!("expected http error, got {:?}", other),
    }
    assert!(next_item(&mut stream).await.is_none());
    assert_eq!(fixture.unsubscribes(), 1);
}

#[tokio::test]
async fn test_initiating_graphql_errors() {
    let single = TestFixture::setup(5_000, 200, json!({ "errors": [{ "message": "nope" }] })).await;
    let mut stream = single.subscribe();
    let error = next_item(&mut stream).await.unwrap().unwrap_err();
    assert!(matches!(&error, TransportError::Remote(e) if e.message == "nope"));
    assert_eq!(error.to_string(), "nope");

    let many = TestFixture::setup(
        5_000,
        200,
        json!({ "errors": [{ "message": "one" }, { "message": "two" }] }),
    )
    .await;
    let mut stream = many.subscribe();
    let error = next_item(&mut stream).await.unwrap().unwrap_err();
    assert!(matches!(&error, TransportError::Aggregate(errors) if errors.len() == 2));
}

#[tokio::test]
async fn test_dropping_stream_cancels_subscription() {
    let fixture = TestFixture::setup(5_000, 200, json!({})).await;
    let stream = fixture.subscribe();
    let id = stream.subscription_id().to_string();
    let verifier = fixture.verifier(&id).await;
    assert_eq!(fixture.executor.active_subscriptions(), 1);

    drop(stream);

    assert_eq!(fixture.executor.active_subscriptions(), 0);
    assert_eq!(fixture.executor.armed_heartbeats(), 0);
    assert_eq!(fixture.unsubscribes(), 1);
    assert_eq!(fixture.callback(&id, &verifier, "next", json!({ "payload": 1 })), 0);
}

#[tokio::test]
async fn test_dispose_stops_every_subscription_once() {
    let fixture = TestFixture::setup(5_000, 200, json!({})).await;
    let mut first = fixture.subscribe();
    let mut second = fixture.subscribe();
    fixture.initiating_request(first.subscription_id()).await;
    fixture.initiating_request(second.subscription_id()).await;
    assert_eq!(fixture.executor.armed_heartbeats(), 2);

    fixture.executor.dispose();
    fixture.executor.dispose();

    assert!(fixture.executor.is_disposed());
    assert!(next_item(&mut first).await.is_none());
    assert!(next_item(&mut second).await.is_none());
    drop(first);
    drop(second);

    assert_eq!(fixture.executor.active_subscriptions(), 0);
    assert_eq!(fixture.executor.armed_heartbeats(), 0);
    assert_eq!(fixture.unsubscribes(), 2);

    let mut late = fixture.subscribe();
    assert!(matches!(next_item(&mut late).await, Some(Err(TransportError::Disposed))));
}

#[tokio::test]
async fn test_interpolated_headers_reach_subgraph() {
    let config = CallbackConfig {
        headers: HashMap::from([(
            "authorization".to_string(),
            "{context.headers.authorization}".to_string(),
        )]),
        ..CallbackConfig::default()
    };
    let fixture = TestFixture::setup_with(
        config,
        200,
        json!({ "data": { "foo": 1 } }),
        Some(("authorization", "Bearer secret-token")),
    )
    .await;

    let headers = HashMap::from([("authorization".to_string(), "Bearer secret-token".to_string())]);
    let context = ExecutionContext::new(headers, Default::default());
    let mut stream = fixture.subscribe_with(context);

    assert_eq!(next_item(&mut stream).await.unwrap().unwrap(), json!({ "foo": 1 }));
}

use futures::Stream;
use reqwest::header::ACCEPT;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::callback_router::{CallbackRouter, CallbackSink};
use crate::config::CallbackConfig;
use crate::error::TransportError;
use crate::headers::HeaderTemplate;
use crate::heartbeat::HeartbeatRegistry;
use crate::pubsub::{MessageHandler, PubSub, callback_topic};
use crate::subscription_registry::{Event, Subscription, SubscriptionRegistry, SubscriptionState};
use crate::{CALLBACK_ACCEPT, ExecutionContext, GraphQLRequest, graphql_errors};

/// Delegates subscription operations to a subgraph that answers through
/// HTTP callbacks instead of a long-lived connection.
pub struct HttpCallbackExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    location: String,
    config: CallbackConfig,
    client: reqwest::Client,
    verifier: Arc<str>,
    router: CallbackRouter,
    headers: HeaderTemplate,
    pubsub: Arc<dyn PubSub>,
    heartbeats: HeartbeatRegistry,
    subscriptions: SubscriptionRegistry,
    disposed: AtomicBool,
}

impl HttpCallbackExecutor {
    pub fn new(location: impl Into<String>, config: CallbackConfig, pubsub: Arc<dyn PubSub>) -> Self {
        HttpCallbackExecutor::with_client(location, config, pubsub, reqwest::Client::new())
    }

    pub fn with_client(
        location: impl Into<String>,
        config: CallbackConfig,
        pubsub: Arc<dyn PubSub>,
        client: reqwest::Client,
    ) -> Self {
        let verifier: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        let headers = HeaderTemplate::new(config.headers.clone());
        HttpCallbackExecutor {
            inner: Arc::new(Inner {
                location: location.into(),
                config,
                client,
                router: CallbackRouter::new(Arc::clone(&verifier)),
                verifier,
                headers,
                pubsub,
                heartbeats: HeartbeatRegistry::new(),
                subscriptions: SubscriptionRegistry::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts a callback subscription. Must be called from within a tokio runtime.
    ///
    /// Dropping the returned stream cancels the subscription.
    pub fn subscribe(&self, request: GraphQLRequest, context: &ExecutionContext) -> ResultStream {
        let inner = &self.inner;
        let id = Uuid::new_v4().to_string();
        let (subscription, events) = Subscription::new(id.clone());
        let stream = ResultStream {
            id: id.clone(),
            events,
            inner: Arc::clone(inner),
            done: false,
        };

        if inner.disposed.load(Ordering::SeqCst) {
            subscription.finish(SubscriptionState::Errored, Some(TransportError::Disposed));
            return stream;
        }

        let topic = callback_topic(&inner.config.path, &id);
        let bus_handle = inner.pubsub.subscribe(&topic, inner.handler(&subscription));
        inner.subscriptions.insert(Arc::clone(&subscription), bus_handle);

        // A dispose that snapshotted the registry before the insert missed us.
        if inner.disposed.load(Ordering::SeqCst) {
            inner.terminate(&subscription, SubscriptionState::Disposed, None);
            return stream;
        }

        inner.arm_heartbeat(&subscription);

        let body = inner.initiating_body(&request, &id);
        let headers = inner.headers.render(context);
        tracing::debug!(subscription_id = %id, location = %inner.location, "starting callback subscription");
        let task = context.wait_until(initiate(Arc::clone(inner), Arc::clone(&subscription), body, headers));
        subscription.attach_request(task.abort_handle());
        if subscription.state().is_terminal() {
            subscription.abort_request();
            inner.finalize(&id);
        }

        stream
    }

    /// Stops every live subscription cleanly and clears all heartbeats.
    /// Calling it again does nothing.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn armed_heartbeats(&self) -> usize {
        self.inner.heartbeats.len()
    }

    /// Generation of the heartbeat currently armed for `id`; changes on every re-arm.
    pub fn heartbeat_generation(&self, id: &str) -> Option<u64> {
        self.inner.heartbeats.generation_of(id)
    }

    pub fn subscription_state(&self, id: &str) -> Option<SubscriptionState> {
        self.inner.subscriptions.get(id).map(|s| s.state())
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }
}

impl Drop for HttpCallbackExecutor {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl Inner {
    fn handler(self: &Arc<Self>, subscription: &Arc<Subscription>) -> MessageHandler {
        let inner = Arc::downgrade(self);
        let subscription = Arc::clone(subscription);
        Arc::new(move |message| {
            if let Some(inner) = inner.upgrade() {
                let delivery = Delivery {
                    inner: &inner,
                    subscription: &subscription,
                };
                inner.router.route(subscription.id(), message, &delivery);
            }
        })
    }

    fn arm_heartbeat(self: &Arc<Self>, subscription: &Arc<Subscription>) {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let expiring = Arc::clone(subscription);
        let interval_ms = self.config.heartbeat_interval;
        self.heartbeats
            .arm(subscription.id(), self.config.heartbeat(), move || {
                if let Some(inner) = inner.upgrade() {
                    tracing::warn!(subscription_id = %expiring.id(), interval_ms, "callback subscription timed out");
                    inner.terminate(
                        &expiring,
                        SubscriptionState::TimedOut,
                        Some(TransportError::Timeout { interval_ms }),
                    );
                }
            });
    }

    fn initiating_body(&self, request: &GraphQLRequest, id: &str) -> Value {
        let mut extensions = request.extensions.clone();
        extensions.insert(
            "subscription".to_string(),
            json!({
                "callbackUrl": self.config.callback_url(id),
                "subscriptionId": id,
                "verifier": &*self.verifier,
                "heartbeatIntervalMs": self.config.heartbeat_interval,
            }),
        );
        json!({
            "query": request.query,
            "variables": request.variables,
            "operationName": request.operation_name,
            "extensions": extensions,
        })
    }

    fn terminate(&self, subscription: &Subscription, state: SubscriptionState, error: Option<TransportError>) {
        if subscription.finish(state, error) {
            tracing::debug!(subscription_id = %subscription.id(), ?state, "callback subscription finished");
        }
        self.finalize(subscription.id());
    }

    /// Runs once per subscription: whoever removes the registry entry cleans up.
    fn finalize(&self, id: &str) {
        self.heartbeats.clear(id);
        if let Some((subscription, bus_handle)) = self.subscriptions.remove(id) {
            self.pubsub.unsubscribe(bus_handle);
            subscription.abort_request();
        }
    }

    fn cancel(&self, id: &str) {
        if let Some(subscription) = self.subscriptions.get(id) {
            self.terminate(&subscription, SubscriptionState::Cancelled, None);
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let live = self.subscriptions.snapshot();
        tracing::info!(subscriptions = live.len(), "disposing callback transport");
        for subscription in live {
            self.terminate(&subscription, SubscriptionState::Disposed, None);
        }
        self.heartbeats.clear_all();
    }
}

struct Delivery<'a> {
    inner: &'a Arc<Inner>,
    subscription: &'a Arc<Subscription>,
}

impl CallbackSink for Delivery<'_> {
    fn heartbeat(&self) {
        if self.subscription.state().is_terminal() {
            return;
        }
        self.inner.arm_heartbeat(self.subscription);
        if self.subscription.state().is_terminal() {
            self.inner.heartbeats.clear(self.subscription.id());
        }
    }

    fn push(&self, payload: Value) {
        self.subscription.push(payload);
    }

    fn stop(&self, error: Option<TransportError>) {
        let state = match error {
            Some(_) => SubscriptionState::Errored,
            None => SubscriptionState::Completed,
        };
        self.inner.terminate(self.subscription, state, error);
    }
}

async fn initiate(
    inner: Arc<Inner>,
    subscription: Arc<Subscription>,
    body: Value,
    headers: HashMap<String, String>,
) {
    match send_initiating_request(&inner, &body, headers).await {
        Ok(Some(data)) => {
            subscription.push(data);
            inner.terminate(&subscription, SubscriptionState::Completed, None);
        }
        Ok(None) => {
            if subscription.activate() {
                tracing::debug!(subscription_id = %subscription.id(), "waiting for callbacks");
            }
        }
        Err(error) => {
            tracing::warn!(subscription_id = %subscription.id(), error = %error, "subscription request failed");
            inner.terminate(&subscription, SubscriptionState::Errored, Some(error));
        }
    }
}

/// Inline `data` means the subgraph resolved the subscription synchronously.
async fn send_initiating_request(
    inner: &Inner,
    body: &Value,
    headers: HashMap<String, String>,
) -> Result<Option<Value>, TransportError> {
    let mut request = inner
        .client
        .post(&inner.location)
        .header(ACCEPT, CALLBACK_ACCEPT)
        .json(body);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(%status, error = %e, "could not read subgraph error body");
                String::new()
            }
        };
        return Err(TransportError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let payload: Value =
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?;

    let errors = payload.get("errors").map(graphql_errors).unwrap_or_default();
    if let Some(error) = TransportError::from_remote(errors) {
        return Err(error);
    }

    match payload.get("data") {
        Some(data) if !data.is_null() => Ok(Some(data.clone())),
        _ => Ok(None),
    }
}

/// Results of one callback subscription, ending after a clean completion or
/// a single terminal error.
pub struct ResultStream {
    id: String,
    events: mpsc::UnboundedReceiver<Event>,
    inner: Arc<Inner>,
    done: bool,
}

impl ResultStream {
    pub fn subscription_id(&self) -> &str {
        &self.id
    }
}

impl Stream for ResultStream {
    type Item = Result<Value, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match ready!(self.events.poll_recv(cx)) {
            Some(Event::Next(value)) => Poll::Ready(Some(Ok(value))),
            Some(Event::End(Some(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Some(Event::End(None)) | None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.inner.cancel(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::InMemoryPubSub;
    use pretty_assertions::assert_eq;

    fn executor(heartbeat_interval: u64) -> HttpCallbackExecutor {
        let config = CallbackConfig {
            public_url: "https://gateway.test/callback/".to_string(),
            heartbeat_interval,
            ..CallbackConfig::default()
        };
        HttpCallbackExecutor::new("http://127.0.0.1:9/graphql", config, Arc::new(InMemoryPubSub::new()))
    }

    #[test]
    fn initiating_body_carries_subscription_extension() {
        let executor = executor(1000);
        let mut request = GraphQLRequest {
            query: "subscription { onFoo }".to_string(),
            operation_name: Some("OnFoo".to_string()),
            ..GraphQLRequest::default()
        };
        request.extensions.insert("trace".to_string(), json!(true));

        let body = executor.inner.initiating_body(&request, "abc");
        let subscription = &body["extensions"]["subscription"];
        assert_eq!(body["operationName"], "OnFoo");
        assert_eq!(body["extensions"]["trace"], true);
        assert_eq!(subscription["callbackUrl"], "https://gateway.test/callback/abc");
        assert_eq!(subscription["subscriptionId"], "abc");
        assert_eq!(subscription["verifier"], json!(&*executor.inner.verifier));
        assert_eq!(subscription["heartbeatIntervalMs"], 1000);
    }

    #[test]
    fn verifier_is_per_instance() {
        assert_ne!(executor(1000).inner.verifier, executor(1000).inner.verifier);
    }

    #[tokio::test]
    async fn subscribe_after_dispose_fails_immediately() {
        use futures::StreamExt;

        let executor = executor(1000);
        executor.dispose();
        let mut stream = executor.subscribe(GraphQLRequest::default(), &ExecutionContext::default());
        assert!(matches!(stream.next().await, Some(Err(TransportError::Disposed))));
        assert!(stream.next().await.is_none());
        assert_eq!(executor.active_subscriptions(), 0);
    }
}

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::TransportError;
use crate::pubsub::SubscriptionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Initiating,
    Active,
    Completed,
    Errored,
    TimedOut,
    Cancelled,
    Disposed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubscriptionState::Initiating | SubscriptionState::Active)
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    Next(Value),
    End(Option<TransportError>),
}

/// Producer side of one callback subscription.
///
/// The result channel exists before anything else, so `push` and `finish`
/// are always wired. Once a terminal state is reached both become no-ops.
pub struct Subscription {
    id: String,
    state: Mutex<SubscriptionState>,
    events: mpsc::UnboundedSender<Event>,
    request: Mutex<Option<AbortHandle>>,
}

impl Subscription {
    pub(crate) fn new(id: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let subscription = Subscription {
            id,
            state: Mutex::new(SubscriptionState::Initiating),
            events,
            request: Mutex::new(None),
        };
        (Arc::new(subscription), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// `Initiating -> Active`; any other state is left untouched.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Initiating {
            *state = SubscriptionState::Active;
            true
        } else {
            false
        }
    }

    pub fn push(&self, value: Value) -> bool {
        let state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        // A dropped receiver is cancellation, which finalizes on its own.
        self.events.send(Event::Next(value)).is_ok()
    }

    /// Moves to `terminal` unless already terminal. Returns whether this call won.
    pub fn finish(&self, terminal: SubscriptionState, error: Option<TransportError>) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = terminal;
        let _ = self.events.send(Event::End(error));
        true
    }

    pub(crate) fn attach_request(&self, handle: AbortHandle) {
        *self.request.lock() = Some(handle);
    }

    pub(crate) fn abort_request(&self) {
        if let Some(handle) = self.request.lock().take() {
            handle.abort();
        }
    }
}

struct RegistryEntry {
    subscription: Arc<Subscription>,
    bus_handle: SubscriptionHandle,
}

/// Live subscriptions keyed by id.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    pub(crate) fn insert(&self, subscription: Arc<Subscription>, bus_handle: SubscriptionHandle) {
        let id = subscription.id().to_string();
        self.entries.insert(
            id,
            RegistryEntry {
                subscription,
                bus_handle,
            },
        );
    }

    /// Removes `id`. Only one caller ever receives the entry back.
    pub(crate) fn remove(&self, id: &str) -> Option<(Arc<Subscription>, SubscriptionHandle)> {
        self.entries
            .remove(id)
            .map(|(_, entry)| (entry.subscription, entry.bus_handle))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Subscription>> {
        self.entries
            .get(id)
            .map(|entry| Arc::clone(&entry.subscription))
    }

    /// Copy of the live subscriptions, safe to iterate while entries are removed.
    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.subscription))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

struct TimerSlot {
    generation: u64,
    task: JoinHandle<()>,
}

/// One liveness timer per subscription id.
///
/// Every timer carries a generation. An expiring timer only fires if it can
/// remove the slot holding its own generation, so a timer that was cleared or
/// replaced can never reach its callback.
#[derive(Clone, Default)]
pub struct HeartbeatRegistry {
    timers: Arc<DashMap<String, TimerSlot>>,
    generation: Arc<AtomicU64>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        HeartbeatRegistry::default()
    }

    /// Starts or restarts the timer for `id`. Must be called from within a tokio runtime.
    pub fn arm<F>(&self, id: &str, interval: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timers = Arc::clone(&self.timers);
        let key = id.to_string();

        // The entry guard is held until the slot is in place, so the timer
        // task cannot look for its slot before it exists.
        let entry = self.timers.entry(key.clone());
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let expired = timers
                .remove_if(&key, |_, slot| slot.generation == generation)
                .is_some();
            if expired {
                tracing::debug!(subscription_id = %key, "heartbeat expired");
                on_expire();
            }
        });
        let slot = TimerSlot { generation, task };

        match entry {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(slot);
                previous.task.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
            }
        }
    }

    /// Cancels the timer for `id`. Clearing an unknown id is a no-op.
    pub fn clear(&self, id: &str) {
        if let Some((_, slot)) = self.timers.remove(id) {
            slot.task.abort();
        }
    }

    pub fn clear_all(&self) {
        let ids: Vec<String> = self.timers.iter().map(|slot| slot.key().clone()).collect();
        for id in ids {
            self.clear(&id);
        }
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.timers.contains_key(id)
    }

    pub fn generation_of(&self, id: &str) -> Option<u64> {
        self.timers.get(id).map(|slot| slot.generation)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

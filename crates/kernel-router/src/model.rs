//! Keyed store of the entities the front end has in view.
//!
//! Entries keep their first-insertion position; overwriting an id updates
//! its value in place. Every mutation publishes a [`ModelChange`] carrying
//! the full current id set on the model's own bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::bus::SubscriberBus;

/// Published after every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChange {
    /// All ids currently present, in insertion order.
    pub ids: Vec<String>,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    seq: u64,
}

#[derive(Debug, Default)]
struct ModelState {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    disposed: bool,
}

impl ModelState {
    fn ids(&self) -> Vec<String> {
        let mut ordered: Vec<(&String, u64)> =
            self.entries.iter().map(|(id, e)| (id, e.seq)).collect();
        ordered.sort_by_key(|(_, seq)| *seq);
        ordered.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[derive(Clone, Default)]
pub struct Model {
    state: Arc<StdMutex<ModelState>>,
    changed: SubscriberBus<ModelChange>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bus on which [`ModelChange`] notifications are published.
    pub fn changed(&self) -> &SubscriberBus<ModelChange> {
        &self.changed
    }

    /// Insert `value` under `id`, or overwrite the existing value.
    pub fn append(&self, id: impl Into<String>, value: Value) {
        let id = id.into();
        let ids = {
            let mut state = self.lock();
            if state.disposed {
                warn!("[model] Ignoring append of {} after dispose", id);
                return;
            }
            let seq = match state.entries.get(&id) {
                Some(existing) => existing.seq,
                None => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    seq
                }
            };
            state.entries.insert(id, Entry { value, seq });
            state.ids()
        };
        self.changed.publish(ModelChange { ids });
    }

    /// Remove `id`. Removing an absent id changes nothing and publishes
    /// nothing. Returns whether an entry was removed.
    pub fn remove(&self, id: &str) -> bool {
        let ids = {
            let mut state = self.lock();
            if state.entries.remove(id).is_none() {
                debug!("[model] Remove of unknown id {}", id);
                return false;
            }
            state.ids()
        };
        self.changed.publish(ModelChange { ids });
        true
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.lock().entries.get(id).map(|e| e.value.clone())
    }

    /// Current ids in insertion order.
    pub fn ids(&self) -> Vec<String> {
        self.lock().ids()
    }

    /// `(id, value)` pairs in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        let state = self.lock();
        state
            .ids()
            .into_iter()
            .filter_map(|id| {
                let value = state.entries.get(&id)?.value.clone();
                Some((id, value))
            })
            .collect()
    }

    /// JSON object of `id -> value`.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.entries().into_iter().collect::<Map<String, Value>>())
    }

    /// Release all entries. Publishes nothing; later appends are ignored.
    pub fn dispose(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("ids", &self.ids()).finish()
    }
}

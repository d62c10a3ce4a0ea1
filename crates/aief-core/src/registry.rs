// ── Subscription registry ──
//
// Keyed by (collection, document path). Each key owns exactly one backend
// listener guard and an ordered list of callbacks. Snapshots are fanned
// out to a copy of the callback list so the lock is never held while user
// code runs. Every listener carries a generation; a sink only ever
// delivers to the entry its listener was opened for.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use aief_api::SnapshotSink;

use crate::backend::{ListenerGuard, RealtimeBackend};

/// Error type callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A change callback. Receives the new snapshot of its document.
pub type ChangeCallback = Arc<dyn Fn(&DocumentSnapshot) -> Result<(), BoxError> + Send + Sync>;

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The state of one document as delivered to callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub collection: String,
    pub document_path: String,
    /// `None` when nothing is stored at the path.
    pub data: Option<Value>,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }
}

/// Location of a document in the real-time tree.
pub(crate) fn tree_path(collection: &str, document_path: &str) -> String {
    format!("/{collection}/{}", document_path.trim_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    collection: String,
    document_path: String,
}

struct Entry {
    generation: u64,
    callbacks: Vec<(SubscriptionId, ChangeCallback)>,
    guard: Box<dyn ListenerGuard>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<SubscriptionKey, Entry>,
    index: HashMap<SubscriptionId, SubscriptionKey>,
    next_generation: u64,
}

/// Tracks change listeners; at most one backend listener per key.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("listeners", &self.listener_count())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `(collection, document_path)`.
    ///
    /// The first subscriber to a key opens the backend listener at
    /// `/{collection}/{document_path}`; later subscribers share it. The
    /// lookup, listener creation and insert happen under one lock.
    pub fn subscribe(
        &self,
        realtime: &dyn RealtimeBackend,
        collection: &str,
        document_path: &str,
        callback: ChangeCallback,
    ) -> Result<SubscriptionId, aief_api::Error> {
        let key = SubscriptionKey {
            collection: collection.to_owned(),
            document_path: document_path.trim_matches('/').to_owned(),
        };
        let id = SubscriptionId::new();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                occupied.get_mut().callbacks.push((id, callback));
                debug!(
                    collection,
                    document_path = %key.document_path,
                    callbacks = occupied.get().callbacks.len(),
                    "callback added to existing listener"
                );
            }
            MapEntry::Vacant(vacant) => {
                let generation = inner.next_generation;
                let path = tree_path(&key.collection, &key.document_path);
                let listener = realtime.listen(&path, self.sink_for(key.clone(), generation))?;
                info!(path = %path, generation, "backend listener opened");
                vacant.insert(Entry {
                    generation,
                    callbacks: vec![(id, callback)],
                    guard: listener,
                });
                inner.next_generation = generation.wrapping_add(1);
            }
        }

        inner.index.insert(id, key);
        Ok(id)
    }

    /// Remove one callback. Removing the last callback of a key drops its
    /// backend listener before the lock is released, so a new subscriber
    /// to the same key never overlaps the old listener. Returns `false` for
    /// unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let released = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let Some(key) = inner.index.remove(&id) else {
                return false;
            };

            let now_empty = inner.entries.get_mut(&key).is_some_and(|entry| {
                entry.callbacks.retain(|(cid, _)| *cid != id);
                entry.callbacks.is_empty()
            });

            let emptied = if now_empty { inner.entries.remove(&key) } else { None };
            match emptied {
                Some(Entry {
                    generation,
                    callbacks,
                    guard: listener,
                }) => {
                    info!(
                        path = listener.path(),
                        generation, "last callback removed, closing backend listener"
                    );
                    drop(listener);
                    callbacks
                }
                None => Vec::new(),
            }
        };

        // Callback captures are dropped outside the lock.
        drop(released);
        true
    }

    /// Registered callbacks across all keys.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Live backend listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn sink_for(&self, key: SubscriptionKey, generation: u64) -> SnapshotSink {
        let registry = Arc::downgrade(&self.inner);
        Arc::new(move |value: Value| dispatch(&registry, &key, generation, value))
    }
}

/// Deliver one snapshot to every callback currently registered for `key`,
/// in registration order. Snapshots from a listener of another generation
/// are dropped.
fn dispatch(
    registry: &Weak<Mutex<RegistryInner>>,
    key: &SubscriptionKey,
    generation: u64,
    value: Value,
) {
    let Some(inner) = registry.upgrade() else {
        return;
    };

    let callbacks: Vec<(SubscriptionId, ChangeCallback)> = match inner.lock().entries.get(key) {
        Some(entry) if entry.generation == generation => entry.callbacks.clone(),
        Some(_) => {
            debug!(collection = %key.collection, generation, "dropping snapshot from a closed listener");
            return;
        }
        None => return,
    };

    let snapshot = DocumentSnapshot {
        collection: key.collection.clone(),
        document_path: key.document_path.clone(),
        data: if value.is_null() { None } else { Some(value) },
    };

    for (id, callback) in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(&snapshot))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(subscription = %id, collection = %key.collection, error = %e, "change callback failed");
            }
            Err(_) => {
                error!(subscription = %id, collection = %key.collection, "change callback panicked");
            }
        }
    }
}

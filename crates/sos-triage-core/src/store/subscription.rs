//! Live subscriptions and ordered snapshot delivery.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::db::CaseQuery;
use crate::models::Case;

/// Callback receiving pushed snapshots.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct DeliveryState<T> {
    pending: BTreeMap<u64, T>,
    delivered: Option<u64>,
    draining: bool,
    active: bool,
}

/// Per-subscription delivery queue.
///
/// Snapshots are delivered one at a time in increasing revision order; stale
/// revisions are dropped. Whoever finds the queue idle drains it, so a
/// listener that writes back into the store (and thereby offers a new
/// snapshot to itself) just enqueues and returns.
pub(crate) struct Delivery<T> {
    state: Mutex<DeliveryState<T>>,
    listener: Listener<T>,
}

impl<T> Delivery<T> {
    pub(crate) fn new(listener: Listener<T>) -> Self {
        Self {
            state: Mutex::new(DeliveryState {
                pending: BTreeMap::new(),
                delivered: None,
                draining: false,
                active: true,
            }),
            listener,
        }
    }

    fn state(&self) -> MutexGuard<'_, DeliveryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn offer(&self, revision: u64, snapshot: T) {
        {
            let mut state = self.state();
            if !state.active || state.delivered.is_some_and(|seen| revision <= seen) {
                return;
            }
            state.pending.insert(revision, snapshot);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.state();
                if !state.active {
                    state.pending.clear();
                    state.draining = false;
                    return;
                }
                match state.pending.pop_first() {
                    Some((revision, snapshot)) => {
                        state.delivered = Some(revision);
                        snapshot
                    }
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            (self.listener)(&next);
        }
    }

    pub(crate) fn deactivate(&self) {
        let mut state = self.state();
        state.active = false;
        state.pending.clear();
    }
}

struct DocumentEntry {
    id: u64,
    case_id: String,
    delivery: Arc<Delivery<Case>>,
}

struct QueryEntry {
    id: u64,
    query: CaseQuery,
    delivery: Arc<Delivery<Vec<Case>>>,
}

/// Registered subscriptions, by document and by query.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    documents: Mutex<Vec<DocumentEntry>>,
    queries: Mutex<Vec<QueryEntry>>,
}

impl Registry {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add_document(
        self: &Arc<Self>,
        case_id: &str,
        delivery: Arc<Delivery<Case>>,
    ) -> Subscription {
        let id = self.next_id();
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DocumentEntry {
                id,
                case_id: case_id.to_string(),
                delivery,
            });
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub(crate) fn add_query(
        self: &Arc<Self>,
        query: CaseQuery,
        delivery: Arc<Delivery<Vec<Case>>>,
    ) -> Subscription {
        let id = self.next_id();
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(QueryEntry {
                id,
                query,
                delivery,
            });
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub(crate) fn documents_for(&self, case_id: &str) -> Vec<Arc<Delivery<Case>>> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.case_id == case_id)
            .map(|entry| entry.delivery.clone())
            .collect()
    }

    pub(crate) fn queries(&self) -> Vec<(CaseQuery, Arc<Delivery<Vec<Case>>>)> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (entry.query.clone(), entry.delivery.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner).len()
            + self.queries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn remove(&self, id: u64) {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = documents.iter().position(|entry| entry.id == id) {
            documents.remove(pos).delivery.deactivate();
            return;
        }
        drop(documents);

        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = queries.iter().position(|entry| entry.id == id) {
            queries.remove(pos).delivery.deactivate();
        }
    }
}

/// Handle to a live subscription. Dropping it stops further callbacks; writes
/// already issued are not affected.
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Stop receiving snapshots.
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            tracing::debug!(subscription = self.id, "subscription cancelled");
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

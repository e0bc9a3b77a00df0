//! The process-wide credential slot.
//!
//! `CredentialStore` is the single source of truth for the current
//! [`CredentialPair`]. Every component that needs the pair holds the same
//! `Arc<CredentialStore>`. Mutations replace the whole pair, persist it through
//! a [`SessionStorage`] backend, then notify subscribers.
//!
//! Change detection is implemented: only mutations that change the slot bump
//! the epoch and notify. Clearing an empty store re-persists the removal but
//! fires no subscriber.
//!
//! Notifications are delivered one at a time in the order the mutations were
//! applied, so the last value a subscriber sees is the value in the store.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::codec;
use super::storage::SessionStorage;

/// Access and refresh token, always replaced together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

// Tokens are bearer secrets; keep them out of logs.
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

type Listener = Arc<dyn Fn(Option<&CredentialPair>) + Send + Sync>;
type Listeners = Mutex<Vec<(u64, Listener)>>;

#[derive(Default)]
struct Slot {
    pair: Option<CredentialPair>,
    epoch: u64,
    /// Delivery ticket of the last notifying mutation.
    ticket: u64,
}

/// Hands the notification turn from one mutation to the next.
struct Delivery {
    next: Mutex<u64>,
    turn: Condvar,
}

pub struct CredentialStore {
    slot: RwLock<Slot>,
    storage: Arc<dyn SessionStorage>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    delivery: Delivery,
    watch_tx: watch::Sender<Option<CredentialPair>>,
}

impl CredentialStore {
    /// Create an empty store backed by `storage`, without reading it.
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        let (watch_tx, _) = watch::channel(None);
        Self {
            slot: RwLock::new(Slot::default()),
            storage,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            delivery: Delivery {
                next: Mutex::new(1),
                turn: Condvar::new(),
            },
            watch_tx,
        }
    }

    /// Create a store and restore the pair persisted by a previous run.
    ///
    /// A value that cannot be read, does not parse, or whose access token
    /// does not decode is discarded and removed from storage.
    pub fn load(storage: Arc<dyn SessionStorage>) -> Self {
        let store = Self::new(storage);
        if let Some(pair) = store.restore() {
            debug!("Restored persisted session");
            store.watch_tx.send_replace(Some(pair.clone()));
            let mut slot = store.write_slot();
            slot.pair = Some(pair);
            slot.epoch = 1;
        }
        store
    }

    fn restore(&self) -> Option<CredentialPair> {
        let raw = match self.storage.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                return None;
            }
        };

        let pair = match serde_json::from_str::<CredentialPair>(&raw) {
            Ok(pair) if !pair.access.is_empty() && !pair.refresh.is_empty() => {
                match codec::decode(&pair.access) {
                    Ok(_) => Some(pair),
                    Err(e) => {
                        warn!(error = %e, "Persisted access token does not decode");
                        None
                    }
                }
            }
            Ok(_) => {
                warn!("Persisted session has an empty token");
                None
            }
            Err(e) => {
                warn!(error = %e, "Persisted session is not a credential pair");
                None
            }
        };

        if pair.is_none() {
            if let Err(e) = self.storage.remove() {
                warn!(error = %e, "Failed to discard invalid persisted session");
            }
        }
        pair
    }

    pub fn get(&self) -> Option<CredentialPair> {
        self.read_slot().pair.clone()
    }

    /// Current pair with the epoch it was observed at.
    pub fn snapshot(&self) -> (Option<CredentialPair>, u64) {
        let slot = self.read_slot();
        (slot.pair.clone(), slot.epoch)
    }

    pub fn epoch(&self) -> u64 {
        self.read_slot().epoch
    }

    pub fn is_empty(&self) -> bool {
        self.read_slot().pair.is_none()
    }

    /// Replace the pair, persist it, and notify subscribers.
    pub fn set(&self, pair: CredentialPair) {
        self.mutate(|_| true, Some(pair));
    }

    /// Replace the pair only if nothing changed the store since `epoch`.
    /// Returns whether the pair was stored.
    pub fn set_if_epoch(&self, epoch: u64, pair: CredentialPair) -> bool {
        self.mutate(|slot| slot.epoch == epoch, Some(pair))
    }

    /// Remove the pair. Returns `false` if the store was already empty, in
    /// which case subscribers are not notified.
    pub fn clear(&self) -> bool {
        self.take().is_some()
    }

    /// Remove the pair and return it.
    pub fn take(&self) -> Option<CredentialPair> {
        let (previous, ticket) = {
            let mut slot = self.write_slot();
            let previous = slot.pair.take();
            self.persist(None);
            if previous.is_none() {
                return None;
            }
            slot.epoch += 1;
            slot.ticket += 1;
            self.watch_tx.send_replace(None);
            (previous, slot.ticket)
        };

        self.deliver(ticket, None);
        previous
    }

    /// Remove the pair only if nothing changed the store since `epoch`.
    pub fn clear_if_epoch(&self, epoch: u64) -> bool {
        self.mutate(|slot| slot.epoch == epoch && slot.pair.is_some(), None)
    }

    /// Remove the pair only if it still carries `access`.
    pub fn clear_if_access(&self, access: &str) -> bool {
        self.mutate(
            |slot| slot.pair.as_ref().is_some_and(|p| p.access == access),
            None,
        )
    }

    fn mutate<F>(&self, applies: F, next: Option<CredentialPair>) -> bool
    where
        F: FnOnce(&Slot) -> bool,
    {
        let (snapshot, ticket) = {
            let mut slot = self.write_slot();
            if !applies(&slot) {
                return false;
            }
            slot.pair = next;
            slot.epoch += 1;
            slot.ticket += 1;
            // Persist under the lock so storage order matches memory order.
            self.persist(slot.pair.as_ref());
            self.watch_tx.send_replace(slot.pair.clone());
            (slot.pair.clone(), slot.ticket)
        };

        self.deliver(ticket, snapshot.as_ref());
        true
    }

    fn persist(&self, pair: Option<&CredentialPair>) {
        let result = match pair {
            Some(pair) => serde_json::to_string(pair)
                .map_err(anyhow::Error::from)
                .and_then(|json| self.storage.write(&json)),
            None => self.storage.remove(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session");
        }
    }

    // Waits for every earlier mutation's notification to finish. Runs
    // without the slot lock, so listeners may read the store; a listener
    // that mutates the store would wait on itself.
    fn deliver(&self, ticket: u64, pair: Option<&CredentialPair>) {
        let mut next = self
            .delivery
            .next
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *next != ticket {
            next = self
                .delivery
                .turn
                .wait(next)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.notify(pair)));
        *next += 1;
        drop(next);
        self.delivery.turn.notify_all();
        if let Err(payload) = result {
            panic::resume_unwind(payload);
        }
    }

    fn notify(&self, pair: Option<&CredentialPair>) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(pair);
        }
    }

    /// Call `listener` after every effective `set` or `clear`, with the new
    /// value. Notifications arrive in mutation order and never overlap. The
    /// listener may read the store but must not mutate it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&CredentialPair>) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Async view of the slot for tasks that wait on login/logout.
    pub fn watch(&self) -> watch::Receiver<Option<CredentialPair>> {
        self.watch_tx.subscribe()
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Detaches its listener when dropped or on [`Subscription::unsubscribe`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

//! Single-flight token refresh.
//!
//! Every consumer that needs a usable access token goes through
//! [`RefreshCoordinator::ensure_fresh`]. When the stored token is expiring, the
//! first caller starts one refresh exchange in a spawned task and parks a
//! shared handle to its result in the in-flight marker. Callers arriving while
//! the marker is set await the same handle. The task updates the store before
//! it clears the marker, so a caller that finds no marker always reads the
//! post-refresh pair.
//!
//! The store epoch captured when a refresh starts guards the write-back: a
//! logout (or a new login) during the exchange wins and the result is dropped.
//! Waiters of a dropped refresh, and callers that find a refresh started for
//! an older epoch, wait for it to finish and then decide again against the
//! current store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::codec;
use super::events::{SessionEvent, SessionEvents};
use super::store::{CredentialPair, CredentialStore};
use crate::api::AuthApi;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session expired: {reason}")]
    SessionExpired { reason: String },
}

impl SessionError {
    pub fn expired(reason: impl Into<String>) -> Self {
        SessionError::SessionExpired {
            reason: reason.into(),
        }
    }
}

type RefreshOutcome = Result<CredentialPair, SessionError>;
type SharedRefresh = Shared<BoxFuture<'static, Exchange>>;

/// Result of one exchange as seen by its waiters.
#[derive(Debug, Clone)]
enum Exchange {
    Done(RefreshOutcome),
    /// The store moved to another epoch during the exchange.
    Superseded,
}

struct InFlight {
    id: u64,
    epoch: u64,
    outcome: SharedRefresh,
}

struct Inner {
    store: Arc<CredentialStore>,
    api: Arc<dyn AuthApi>,
    events: SessionEvents,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

/// Clone is cheap and every clone shares the same in-flight marker.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

/// Whether the pair's access token should be replaced before use.
/// An access token that does not decode cannot be judged and is replaced.
fn needs_refresh(pair: &CredentialPair, skew: Duration) -> bool {
    match codec::decode(&pair.access) {
        Ok(claims) => codec::is_expiring(&claims, Utc::now(), skew),
        Err(e) => {
            warn!(error = %e, "Stored access token does not decode");
            true
        }
    }
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, api: Arc<dyn AuthApi>, events: SessionEvents) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                api,
                events,
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return a pair whose access token is valid for at least `skew`,
    /// refreshing it first if needed.
    pub async fn ensure_fresh(&self, skew: Duration) -> Result<CredentialPair, SessionError> {
        self.run(Some(skew)).await
    }

    /// Refresh unconditionally (still joining a refresh already in flight).
    pub async fn force_refresh(&self) -> Result<CredentialPair, SessionError> {
        self.run(None).await
    }

    pub fn is_refresh_in_flight(&self) -> bool {
        self.inner.lock_in_flight().is_some()
    }

    async fn run(&self, skew: Option<Duration>) -> RefreshOutcome {
        loop {
            let (pending, current) = {
                let mut in_flight = self.inner.lock_in_flight();

                // Read under the marker lock: a finished refresh has already
                // written the store by the time its marker is gone.
                let (pair, epoch) = self.inner.store.snapshot();
                let pair = pair.ok_or_else(|| SessionError::expired("not logged in"))?;
                if skew.is_some_and(|s| !needs_refresh(&pair, s)) {
                    return Ok(pair);
                }

                match in_flight.as_ref() {
                    Some(f) => (f.outcome.clone(), f.epoch == epoch),
                    None => (Inner::start(&self.inner, &mut in_flight, pair, epoch), true),
                }
            };

            match pending.await {
                Exchange::Done(outcome) if current => return outcome,
                Exchange::Done(_) => debug!("Waited out a refresh from an earlier session"),
                Exchange::Superseded => debug!("Session changed during refresh; retrying"),
            }
        }
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Caller holds the marker lock, so no second refresh can start.
    fn start(
        this: &Arc<Self>,
        marker: &mut Option<InFlight>,
        pair: CredentialPair,
        epoch: u64,
    ) -> SharedRefresh {
        let id = this.next_id.fetch_add(1, Ordering::Relaxed);

        // Runs on its own task: completes even if every waiter is dropped.
        let task = {
            let inner = Arc::clone(this);
            tokio::spawn(async move {
                let outcome = inner.exchange(pair, epoch).await;
                inner.finish(id);
                outcome
            })
        };

        let inner = Arc::clone(this);
        let outcome = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let outcome = inner.expire(epoch, format!("refresh task failed: {}", e));
                    inner.finish(id);
                    outcome
                }
            }
        }
        .boxed()
        .shared();

        *marker = Some(InFlight {
            id,
            epoch,
            outcome: outcome.clone(),
        });
        outcome
    }

    fn finish(&self, id: u64) {
        let mut marker = self.lock_in_flight();
        if marker.as_ref().is_some_and(|f| f.id == id) {
            *marker = None;
        }
    }

    async fn exchange(&self, pair: CredentialPair, epoch: u64) -> Exchange {
        match codec::decode_expiry(&pair.refresh) {
            Ok(exp) if exp <= Utc::now() => {
                info!(expired_at = %exp, "Refresh token expired; not attempting refresh");
                return self.expire(epoch, "refresh token expired");
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Refresh token is opaque, sending as-is"),
        }

        debug!("Refreshing access token");
        let tokens = match self.api.refresh(&pair.refresh).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                return self.expire(epoch, e.to_string());
            }
        };

        let next = tokens.into_pair(&pair.refresh);
        if self.store.set_if_epoch(epoch, next.clone()) {
            info!("Access token refreshed");
            self.events.emit(SessionEvent::Refreshed);
            return Exchange::Done(Ok(next));
        }

        debug!("Session changed during refresh; discarding refreshed tokens");
        Exchange::Superseded
    }

    /// Tear the session down (once) and build the error for waiters. A
    /// session that already moved on is left alone.
    fn expire(&self, epoch: u64, reason: impl Into<String>) -> Exchange {
        let reason = reason.into();
        if !self.store.clear_if_epoch(epoch) {
            debug!(reason = %reason, "Refresh failed for a session that already changed");
            return Exchange::Superseded;
        }
        self.events.emit(SessionEvent::Expired {
            reason: reason.clone(),
        });
        Exchange::Done(Err(SessionError::expired(reason)))
    }
}

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::refresh::RefreshCoordinator;
use super::store::{CredentialPair, CredentialStore};

/// How often and how early the background timer renews.
#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    /// Time between ticks. Keep it shorter than the access token lifetime.
    pub interval: Duration,
    /// Renew when the access token expires within this window.
    pub skew: chrono::Duration,
    /// Up to this much random delay is added to each tick.
    pub jitter: Duration,
}

/// Background task that renews the session ahead of user requests.
///
/// While a pair is stored, it calls `ensure_fresh(policy.skew)` every
/// `interval` (+ jitter). When the store empties it idles on the store's
/// watch channel and resumes on the next login.
pub struct RenewalTimer;

impl RenewalTimer {
    pub fn spawn(
        coordinator: RefreshCoordinator,
        store: Arc<CredentialStore>,
        policy: RenewalPolicy,
    ) -> RenewalHandle {
        let task = tokio::spawn(async move {
            let mut session = store.watch();
            loop {
                if !wait_until(&mut session, true).await {
                    return;
                }
                info!(interval_secs = policy.interval.as_secs(), "Renewal timer running");
                run_while_logged_in(&coordinator, &store, &mut session, policy).await;
                debug!("Renewal timer idle until next login");
            }
        });
        RenewalHandle { task }
    }
}

async fn run_while_logged_in(
    coordinator: &RefreshCoordinator,
    store: &CredentialStore,
    session: &mut watch::Receiver<Option<CredentialPair>>,
    policy: RenewalPolicy,
) {
    loop {
        let wait = policy.interval + jitter(policy.jitter);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = wait_until(session, false) => return,
        }

        if store.is_empty() {
            return;
        }
        match coordinator.ensure_fresh(policy.skew).await {
            Ok(_) => debug!("Renewal tick: session fresh"),
            Err(e) => {
                info!(error = %e, "Renewal ended the session");
                return;
            }
        }
    }
}

/// Wait until the store is (or is not) holding a pair. Returns `false` if
/// the store is gone.
async fn wait_until(session: &mut watch::Receiver<Option<CredentialPair>>, logged_in: bool) -> bool {
    session
        .wait_for(|pair| pair.is_some() == logged_in)
        .await
        .is_ok()
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Stops the timer when shut down or dropped.
pub struct RenewalHandle {
    task: JoinHandle<()>,
}

impl RenewalHandle {
    pub fn shutdown(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

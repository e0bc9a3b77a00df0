use tokio::sync::broadcast;

use super::Role;

/// Buffer size for session event subscribers.
/// Lifecycle events are rare; 16 covers a burst of login, refresh and expiry.
const EVENT_BUFFER_SIZE: usize = 16;

/// Session lifecycle notifications for the application shell.
///
/// `Expired` replaces a hard redirect to the login screen: the application
/// decides whether to navigate, show a modal, or exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { username: String, role: Role },
    Refreshed,
    LoggedOut,
    Expired { reason: String },
}

#[derive(Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

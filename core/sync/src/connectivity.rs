//! Online/offline signal shared between the host and the sync engine.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Connectivity state published by the host environment.
///
/// Clones share the same state. The engine reads it before every pass and
/// the scheduler subscribes to offline to online transitions.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publish a new state. Subscribers are notified only on change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

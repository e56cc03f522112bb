//! Network connectivity seam
//!
//! The platform layer reports reachability changes; the scheduler and the
//! push listener only read them.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Network reachability as reported by the host platform
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;

    /// Receiver that observes every online/offline transition
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity state fed by the platform layer
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

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
            info!(online, "Connectivity changed");
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Wait until online, bounded by `timeout`. Returns whether we are online.
pub async fn wait_for_online(connectivity: &dyn Connectivity, timeout: Duration) -> bool {
    if connectivity.is_online() {
        return true;
    }

    let mut rx = connectivity.subscribe();
    let wait = async {
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(online) => online,
        Err(_) => {
            debug!(?timeout, "Gave up waiting for connectivity");
            connectivity.is_online()
        }
    }
}

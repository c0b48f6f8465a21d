use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

/// Whether the host currently has network connectivity.
#[async_trait]
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;

    /// Resolve once the host reports it is online.
    async fn wait_online(&self);
}

/// For hosts without an online/offline signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

#[async_trait]
impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    async fn wait_online(&self) {}
}

/// Connectivity driven by the host's online/offline events.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            debug!(online, "Connectivity changed");
            *current = online;
            true
        });
    }
}

#[async_trait]
impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|online| *online).await;
    }
}

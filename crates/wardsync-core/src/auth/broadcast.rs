//! Cross-tab logout signaling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

use super::Storage;

/// Tells other tabs that this tab logged out, and hears when they do.
/// A tab never receives its own signal.
pub trait SessionBroadcaster: Send + Sync {
    fn signal_logout(&self);

    fn subscribe(&self) -> LogoutSignals;
}

/// Logout signals from other tabs.
pub struct LogoutSignals(BoxStream<'static, ()>);

impl LogoutSignals {
    /// Resolves with the next signal; `None` once no more can arrive.
    pub async fn recv(&mut self) -> Option<()> {
        self.0.next().await
    }
}

/// Signals through shared storage: removing the credential key is the
/// logout signal.
#[derive(Clone)]
pub struct StorageBroadcaster {
    storage: Arc<dyn Storage>,
    key: String,
}

impl StorageBroadcaster {
    pub fn new(storage: Arc<dyn Storage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }
}

impl SessionBroadcaster for StorageBroadcaster {
    fn signal_logout(&self) {
        if let Err(e) = self.storage.remove(&self.key) {
            warn!(error = %e, "Failed to clear credential key for logout signal");
        }
    }

    fn subscribe(&self) -> LogoutSignals {
        let events = self.storage.events();
        let feed = (events, self.storage.clone(), self.key.clone());
        let signals = stream::unfold(feed, |(mut events, storage, key)| async move {
            loop {
                match events.recv_checked().await {
                    Ok(Some(event)) => {
                        if event.key == key && event.new_value.is_none() {
                            return Some(((), (events, storage, key)));
                        }
                    }
                    Ok(None) => return None,
                    // The removal may be among the dropped events; the key
                    // itself says whether it happened.
                    Err(lag) => {
                        warn!(error = %lag, "Logout feed lagged, re-reading credential key");
                        match storage.get(&key) {
                            Ok(None) => return Some(((), (events, storage, key))),
                            Ok(Some(_)) => {}
                            Err(e) => warn!(error = %e, "Failed to re-read credential key"),
                        }
                    }
                }
            }
        });
        LogoutSignals(signals.boxed())
    }
}

/// Signals over an in-process channel, for hosts without shared storage
/// events. Handles from [`open_tab`](Self::open_tab) share one channel.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<u64>,
    next_tab: Arc<AtomicU64>,
    tab: u64,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            next_tab: Arc::new(AtomicU64::new(1)),
            tab: 0,
        }
    }

    pub fn open_tab(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            next_tab: self.next_tab.clone(),
            tab: self.next_tab.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroadcaster for ChannelBroadcaster {
    fn signal_logout(&self) {
        let _ = self.tx.send(self.tab);
    }

    fn subscribe(&self) -> LogoutSignals {
        let rx = self.tx.subscribe();
        let tab = self.tab;
        let signals = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(origin) if origin != tab => return Some(((), rx)),
                    Ok(_) => continue,
                    // A dropped signal still means somebody logged out.
                    Err(broadcast::error::RecvError::Lagged(_)) => return Some(((), rx)),
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        LogoutSignals(signals.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStorage;
    use std::time::Duration;

    async fn nothing_within(signals: &mut LogoutSignals) -> bool {
        tokio::time::timeout(Duration::from_millis(20), signals.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_storage_broadcaster_signals_on_key_removal() {
        let storage_a = MemoryStorage::new();
        let storage_b = storage_a.open_tab();
        storage_a.set("cred", "{}").unwrap();

        let tab_a = StorageBroadcaster::new(Arc::new(storage_a.clone()), "cred");
        let tab_b = StorageBroadcaster::new(Arc::new(storage_b), "cred");
        let mut signals_a = tab_a.subscribe();
        let mut signals_b = tab_b.subscribe();

        // Unrelated keys and writes are not logout signals.
        storage_a.set("theme", "dark").unwrap();
        storage_a.set("cred", r#"{"access_token":"new"}"#).unwrap();

        tab_a.signal_logout();
        assert_eq!(signals_b.recv().await, Some(()));
        assert!(nothing_within(&mut signals_a).await);

        // Already removed: a second signal is a no-op.
        tab_a.signal_logout();
        assert!(nothing_within(&mut signals_b).await);
    }

    #[tokio::test]
    async fn test_storage_broadcaster_recovers_removal_dropped_by_lag() {
        let storage_a = MemoryStorage::new();
        let storage_b = storage_a.open_tab();
        storage_a.set("cred", "{}").unwrap();
        let mut signals_b = StorageBroadcaster::new(Arc::new(storage_b), "cred").subscribe();

        // The removal is pushed out of tab B's buffer before B reads it.
        storage_a.remove("cred").unwrap();
        for i in 0..100 {
            storage_a.set(&format!("draft-{}", i), "x").unwrap();
        }

        assert_eq!(signals_b.recv().await, Some(()));
        assert!(nothing_within(&mut signals_b).await);
    }

    #[tokio::test]
    async fn test_storage_broadcaster_lag_without_removal_is_silent() {
        let storage_a = MemoryStorage::new();
        let storage_b = storage_a.open_tab();
        storage_a.set("cred", "{}").unwrap();
        let mut signals_b = StorageBroadcaster::new(Arc::new(storage_b), "cred").subscribe();

        for i in 0..100 {
            storage_a.set(&format!("draft-{}", i), "x").unwrap();
        }

        assert!(nothing_within(&mut signals_b).await);
    }

    #[tokio::test]
    async fn test_channel_broadcaster_skips_own_signal() {
        let tab_a = ChannelBroadcaster::new();
        let tab_b = tab_a.open_tab();
        let tab_c = tab_a.open_tab();
        let mut signals_a = tab_a.subscribe();
        let mut signals_b = tab_b.subscribe();
        let mut signals_c = tab_c.subscribe();

        tab_b.signal_logout();

        assert_eq!(signals_a.recv().await, Some(()));
        assert_eq!(signals_c.recv().await, Some(()));
        assert!(nothing_within(&mut signals_b).await);
    }
}

//! Key/value persistence shared between tabs, with a change feed.
//!
//! Semantics follow browser `localStorage`: writes are visible to every tab
//! sharing the storage area, and each tab is told about changes made by the
//! *other* tabs only. Removing a key that is not there changes nothing and
//! produces no event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use keyring::Entry;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Buffered change events per subscriber before the oldest are dropped.
const EVENT_BUFFER_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Failed to encode stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Change events were dropped because the receiver fell behind.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Storage change feed skipped {0} events")]
pub struct FeedLagged(pub u64);

/// A change made by another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Feed of changes made through other handles to the same storage area.
    fn events(&self) -> StorageEvents;
}

type Origin = u64;

/// Receiving end of a storage change feed.
pub struct StorageEvents {
    rx: broadcast::Receiver<(Origin, StorageEvent)>,
    tab: Origin,
}

impl StorageEvents {
    /// Next change from another tab; `None` once the storage is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.recv_checked().await {
                Ok(event) => return event,
                Err(FeedLagged(skipped)) => warn!(skipped, "Storage change feed lagged"),
            }
        }
    }

    /// Like [`recv`](Self::recv), but reports a lag instead of skipping past
    /// it. The feed continues with the oldest change still buffered.
    pub async fn recv_checked(&mut self) -> Result<Option<StorageEvent>, FeedLagged> {
        loop {
            match self.rx.recv().await {
                Ok((origin, event)) if origin != self.tab => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => return Err(FeedLagged(skipped)),
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

struct MemoryArea {
    values: Mutex<HashMap<String, String>>,
    tx: broadcast::Sender<(Origin, StorageEvent)>,
    next_tab: AtomicU64,
}

/// In-process storage area. Each handle from [`open_tab`](Self::open_tab)
/// behaves like a separate browser tab on the same origin.
#[derive(Clone)]
pub struct MemoryStorage {
    area: Arc<MemoryArea>,
    tab: Origin,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            area: Arc::new(MemoryArea {
                values: Mutex::new(HashMap::new()),
                tx,
                next_tab: AtomicU64::new(1),
            }),
            tab: 0,
        }
    }

    /// Another handle onto the same area, with its own identity.
    pub fn open_tab(&self) -> Self {
        Self {
            area: self.area.clone(),
            tab: self.area.next_tab.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn publish(&self, key: &str, new_value: Option<String>) {
        // No subscribers is fine.
        let _ = self.area.tx.send((
            self.tab,
            StorageEvent {
                key: key.to_string(),
                new_value,
            },
        ));
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.area.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let changed = {
            let mut values = self.area.values.lock().unwrap_or_else(PoisonError::into_inner);
            values.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        };
        if changed {
            self.publish(key, Some(value.to_string()));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = {
            let mut values = self.area.values.lock().unwrap_or_else(PoisonError::into_inner);
            values.remove(key).is_some()
        };
        if removed {
            self.publish(key, None);
        }
        Ok(())
    }

    fn events(&self) -> StorageEvents {
        StorageEvents {
            rx: self.area.tx.subscribe(),
            tab: self.tab,
        }
    }
}

/// Storage in the OS keychain. Survives restarts; there is no cross-process
/// change feed, so its event stream stays silent.
pub struct KeyringStorage {
    service: String,
    tx: broadcast::Sender<(Origin, StorageEvent)>,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            service: service.into(),
            tx,
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Entry::new(&self.service, key)
            .map_err(|e| StorageError::Backend(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Storage for KeyringStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Backend(format!(
                "Failed to read from keychain: {}",
                e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StorageError::Backend(format!("Failed to store in keychain: {}", e)))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::Backend(format!(
                "Failed to delete from keychain: {}",
                e
            ))),
        }
    }

    fn events(&self) -> StorageEvents {
        StorageEvents {
            rx: self.tx.subscribe(),
            tab: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tabs_share_values() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.open_tab();

        tab_a.set("k", "v").unwrap();
        assert_eq!(tab_b.get("k").unwrap().as_deref(), Some("v"));

        tab_b.remove("k").unwrap();
        assert_eq!(tab_a.get("k").unwrap(), None);
    }

    #[tokio::test]
    async fn test_events_only_reach_other_tabs() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.open_tab();
        let mut events_a = tab_a.events();
        let mut events_b = tab_b.events();

        tab_a.set("k", "v").unwrap();
        tab_a.remove("k").unwrap();

        assert_eq!(
            events_b.recv().await,
            Some(StorageEvent { key: "k".into(), new_value: Some("v".into()) })
        );
        assert_eq!(
            events_b.recv().await,
            Some(StorageEvent { key: "k".into(), new_value: None })
        );
        let own = tokio::time::timeout(Duration::from_millis(20), events_a.recv()).await;
        assert!(own.is_err(), "writer must not see its own changes");
    }

    #[tokio::test]
    async fn test_noop_changes_emit_nothing() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.open_tab();
        let mut events_b = tab_b.events();

        tab_a.remove("missing").unwrap();
        tab_a.set("k", "v").unwrap();
        tab_a.set("k", "v").unwrap();

        assert_eq!(events_b.recv().await.unwrap().new_value.as_deref(), Some("v"));
        let next = tokio::time::timeout(Duration::from_millis(20), events_b.recv()).await;
        assert!(next.is_err());
    }
}

//! Authentication state for the sync layer.
//!
//! This module provides:
//! - `Session`: the held credential, login/logout and change notifications
//! - `CredentialStore`: the credential persisted under a fixed storage key
//! - `Reauthenticator`: bearer-authenticated fetches that refresh on 401
//! - `SessionMonitor`: periodic expiry checks and cross-tab logout
//!
//! Tabs sharing a storage area learn about each other's logouts through a
//! `SessionBroadcaster`; the storage adapter treats removal of the credential
//! key as the signal.

pub mod broadcast;
pub mod credentials;
pub mod monitor;
pub mod reauth;
pub mod session;
pub mod storage;

pub use broadcast::{ChannelBroadcaster, LogoutSignals, SessionBroadcaster, StorageBroadcaster};
pub use credentials::{Credential, CredentialStore, CREDENTIAL_KEY};
pub use monitor::{
    CheckOutcome, CheckTrigger, MonitorConfig, MonitorHandle, SessionMonitor, Visibility,
};
pub use reauth::{Reauthenticator, DEFAULT_REFRESH_PATH};
pub use session::{ListenerId, LogoutReason, Session, SessionChange, SessionState};
pub use storage::{
    FeedLagged, KeyringStorage, MemoryStorage, Storage, StorageError, StorageEvent, StorageEvents,
};

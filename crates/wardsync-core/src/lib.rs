//! Wardsync core - client-side data synchronization for a remote JSON API.
//!
//! Reads go through a deduplicating, tag-invalidated request cache; requests
//! are retried on transient network failures and transparently
//! reauthenticated on 401; the session is validated in the background and
//! follows logouts made in other tabs that share its storage.
//!
//! Start with [`SyncClient::builder`].

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;

#[cfg(test)]
mod test_support;

pub use api::{ApiError, ApiRequest, Method};
pub use auth::{Credential, LogoutReason, Session, SessionChange, SessionState, Visibility};
pub use cache::{CacheStore, Endpoint, Fingerprint, QueryEndpoint, Tag};
pub use client::{SyncClient, SyncClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;

//! In-memory request cache with tag-based invalidation.
//!
//! This module provides the `CacheStore`, which keys every read by a
//! `Fingerprint` of its operation and arguments, shares one network request
//! among concurrent identical reads, and evicts entries some time after
//! their last subscriber leaves.
//!
//! Successful reads provide `Tag`s; a mutation names the tags it
//! invalidates, and every entry providing one of them is refetched.

pub mod endpoint;
pub mod fingerprint;
pub mod store;
pub mod tags;

pub use endpoint::{Endpoint, QueryEndpoint};
pub use fingerprint::Fingerprint;
pub use store::{
    CacheStore, EntrySnapshot, EntryStatus, StoreConfig, WeakCacheStore, DEFAULT_RETENTION_SECS,
};
pub use tags::{Tag, TagIndex, LIST_ID};

//! The request cache: deduplicated reads, subscriber bookkeeping, retention
//! and tag-driven invalidation.
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! await. Network work runs in spawned tasks so that an entry's fetch keeps
//! going when the caller that started it goes away; every caller that
//! asks for the same fingerprint meanwhile awaits the same shared result.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Endpoint, Fingerprint, QueryEndpoint, Tag, TagIndex};
use crate::api::{ApiError, ApiRequest, Fetch};
use crate::clock::Clock;

/// Default grace period before an unused entry is evicted.
pub const DEFAULT_RETENTION_SECS: u64 = 60;

type SharedResult = Shared<BoxFuture<'static, Result<Arc<Value>, ApiError>>>;
type TagProvider = Arc<dyn Fn(&Value) -> Vec<Tag> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long an entry without subscribers is kept before eviction.
    pub retention: Duration,
    /// Resolved entries older than this are refetched by the next query.
    pub max_age: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            max_age: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Resolved,
    Rejected,
}

/// Read-only view of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub fingerprint: Fingerprint,
    pub status: EntryStatus,
    pub value: Option<Arc<Value>>,
    pub error: Option<ApiError>,
    pub tags: HashSet<Tag>,
    pub subscriber_count: usize,
    pub stale: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// What is needed to (re)issue the request behind an entry.
#[derive(Clone)]
struct QueryPlan {
    request: ApiRequest,
    provides: TagProvider,
}

impl QueryPlan {
    fn for_endpoint<E: QueryEndpoint>(endpoint: &E, args: &E::Args) -> Self {
        let request = endpoint.request(args);
        let endpoint = endpoint.clone();
        let args = args.clone();
        let provides: TagProvider = Arc::new(move |value: &Value| {
            match <E::Output as Deserialize>::deserialize(value) {
                Ok(output) => endpoint.provides_tags(&args, &output),
                Err(_) => Vec::new(),
            }
        });
        Self { request, provides }
    }
}

struct InFlight {
    fetch_id: u64,
    /// Invalidation epoch when the request went out.
    since: u64,
    result: SharedResult,
}

struct CacheEntry {
    plan: QueryPlan,
    status: EntryStatus,
    value: Option<Arc<Value>>,
    error: Option<ApiError>,
    subscriber_count: usize,
    stale: bool,
    last_updated: Option<DateTime<Utc>>,
    in_flight: Option<InFlight>,
    /// Bumped whenever a pending eviction must be ignored.
    eviction_token: u64,
}

impl CacheEntry {
    fn new(plan: QueryPlan) -> Self {
        Self {
            plan,
            status: EntryStatus::Pending,
            value: None,
            error: None,
            subscriber_count: 0,
            stale: false,
            last_updated: None,
            in_flight: None,
            eviction_token: 0,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        if self.stale || self.status == EntryStatus::Pending {
            return false;
        }
        match (max_age, self.last_updated) {
            (Some(max_age), Some(updated)) => {
                let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
                now - updated <= max_age
            }
            _ => true,
        }
    }

    fn settled(&self) -> Result<Arc<Value>, ApiError> {
        match (&self.value, &self.error, self.status) {
            (_, Some(err), EntryStatus::Rejected) => Err(err.clone()),
            (Some(value), _, _) => Ok(value.clone()),
            _ => Err(ApiError::InvalidResponse("cache entry has no value".to_string())),
        }
    }
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<Fingerprint, CacheEntry>,
    tags: TagIndex,
    next_fetch_id: u64,
    invalidation_epoch: u64,
    /// Tags invalidated while fetches were running, by epoch. A fetch whose
    /// entry had no tags yet checks its result against these.
    invalidations: Vec<(u64, Vec<Tag>)>,
}

impl StoreState {
    fn invalidated_since(&self, since: u64, provided: &[Tag]) -> bool {
        self.invalidations
            .iter()
            .filter(|(epoch, _)| *epoch > since)
            .flat_map(|(_, tags)| tags)
            .any(|tag| provided.iter().any(|p| tag.covers(p)))
    }

    /// Forget invalidations no running fetch started before.
    fn prune_invalidations(&mut self) {
        let oldest = self
            .entries
            .values()
            .filter_map(|entry| entry.in_flight.as_ref())
            .map(|in_flight| in_flight.since)
            .min();
        match oldest {
            Some(oldest) => self.invalidations.retain(|(epoch, _)| *epoch > oldest),
            None => self.invalidations.clear(),
        }
    }
}

enum Completion {
    Stored,
    Discarded,
    /// The result predates an invalidation of its tags; fetch again.
    Invalidated,
}

struct StoreInner {
    fetcher: Arc<dyn Fetch>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    state: Mutex<StoreState>,
}

enum Lookup {
    Ready(Result<Arc<Value>, ApiError>),
    Wait(SharedResult),
}

/// Normalized request cache. Cloning shares the same cache.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    pub fn new(fetcher: Arc<dyn Fetch>, clock: Arc<dyn Clock>, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                fetcher,
                clock,
                config,
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakCacheStore {
        WeakCacheStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribing read.
    ///
    /// Adds one subscriber to the entry for `(endpoint, args)`; balance it
    /// with [`unsubscribe`](Self::unsubscribe). A fresh cached result (or
    /// cached failure) is returned without touching the network; a request
    /// already in flight for the same fingerprint is joined.
    pub async fn query<E: QueryEndpoint>(&self, endpoint: &E, args: &E::Args) -> Result<E::Output, ApiError> {
        let fingerprint = Fingerprint::of(endpoint.name(), args)?;
        let value = self
            .read(&fingerprint, || QueryPlan::for_endpoint(endpoint, args))
            .await?;
        decode::<E::Output>(endpoint.name(), &value)
    }

    async fn read(
        &self,
        fingerprint: &Fingerprint,
        plan: impl FnOnce() -> QueryPlan,
    ) -> Result<Arc<Value>, ApiError> {
        let lookup = {
            let now = self.inner.clock.now();
            let mut state = self.state();
            let entry = state
                .entries
                .entry(fingerprint.clone())
                .or_insert_with(|| CacheEntry::new(plan()));
            entry.subscriber_count += 1;
            entry.eviction_token += 1;

            if let Some(in_flight) = &entry.in_flight {
                debug!(fingerprint = %fingerprint, "Joining in-flight request");
                Lookup::Wait(in_flight.result.clone())
            } else if entry.is_fresh(now, self.inner.config.max_age) {
                debug!(fingerprint = %fingerprint, "Cache hit");
                Lookup::Ready(entry.settled())
            } else {
                Lookup::Wait(self.start_fetch(&mut state, fingerprint))
            }
        };

        match lookup {
            Lookup::Ready(result) => result,
            Lookup::Wait(in_flight) => in_flight.await,
        }
    }

    /// Start a fetch for an existing entry and make it the entry's in-flight
    /// request. A fetch already running is awaited first, so there is never
    /// more than one network call per fingerprint at a time. A result that an
    /// invalidation made during the request applies to is not stored; the
    /// request is issued again and its waiters get the newer result.
    fn start_fetch(&self, state: &mut StoreState, fingerprint: &Fingerprint) -> SharedResult {
        let fetch_id = state.next_fetch_id;
        state.next_fetch_id += 1;
        let since = state.invalidation_epoch;

        let Some(entry) = state.entries.get_mut(fingerprint) else {
            return futures::future::ready(Err(ApiError::Validation(format!(
                "No cache entry for {}",
                fingerprint
            ))))
            .boxed()
            .shared();
        };
        let previous = entry.in_flight.take().map(|in_flight| in_flight.result);
        entry.status = EntryStatus::Pending;

        let store = self.clone();
        let plan = entry.plan.clone();
        let key = fingerprint.clone();
        debug!(fingerprint = %fingerprint, fetch_id, chained = previous.is_some(), "Starting fetch");
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            loop {
                let result = store.inner.fetcher.fetch(&plan.request).await.map(Arc::new);
                match store.complete(&key, fetch_id, &plan, &result) {
                    Completion::Stored | Completion::Discarded => return result,
                    Completion::Invalidated => continue,
                }
            }
        });

        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ApiError::Network {
                    message: format!("fetch task failed: {}", e),
                    transient: false,
                }),
            }
        }
        .boxed()
        .shared();
        entry.in_flight = Some(InFlight {
            fetch_id,
            since,
            result: shared.clone(),
        });
        shared
    }

    fn complete(
        &self,
        fingerprint: &Fingerprint,
        fetch_id: u64,
        plan: &QueryPlan,
        result: &Result<Arc<Value>, ApiError>,
    ) -> Completion {
        let mut state = self.state();
        let completion = self.store_result(&mut state, fingerprint, fetch_id, plan, result);
        state.prune_invalidations();
        completion
    }

    fn store_result(
        &self,
        state: &mut StoreState,
        fingerprint: &Fingerprint,
        fetch_id: u64,
        plan: &QueryPlan,
        result: &Result<Arc<Value>, ApiError>,
    ) -> Completion {
        let now = self.inner.clock.now();
        let Some(since) = state
            .entries
            .get(fingerprint)
            .and_then(|entry| entry.in_flight.as_ref())
            .filter(|in_flight| in_flight.fetch_id == fetch_id)
            .map(|in_flight| in_flight.since)
        else {
            debug!(fingerprint = %fingerprint, fetch_id, "Discarding superseded result");
            return Completion::Discarded;
        };

        let provided = match result {
            Ok(value) => (plan.provides)(value),
            Err(_) => Vec::new(),
        };
        if state.invalidated_since(since, &provided) {
            debug!(fingerprint = %fingerprint, fetch_id, "Result predates an invalidation, refetching");
            let epoch = state.invalidation_epoch;
            if let Some(in_flight) = state.entries.get_mut(fingerprint).and_then(|e| e.in_flight.as_mut()) {
                in_flight.since = epoch;
            }
            return Completion::Invalidated;
        }

        let StoreState { entries, tags, .. } = state;
        let Some(entry) = entries.get_mut(fingerprint) else {
            return Completion::Discarded;
        };
        entry.in_flight = None;
        entry.stale = false;
        entry.last_updated = Some(now);
        match result {
            Ok(value) => {
                entry.status = EntryStatus::Resolved;
                entry.value = Some(value.clone());
                entry.error = None;
                tags.provide(fingerprint, provided);
            }
            Err(err) => {
                debug!(fingerprint = %fingerprint, error = %err, "Caching failed result");
                entry.status = EntryStatus::Rejected;
                entry.error = Some(err.clone());
            }
        }

        if entry.subscriber_count == 0 {
            self.schedule_eviction(fingerprint, entry);
        }
        Completion::Stored
    }

    fn schedule_eviction(&self, fingerprint: &Fingerprint, entry: &mut CacheEntry) {
        entry.eviction_token += 1;
        let token = entry.eviction_token;
        let store = self.clone();
        let key = fingerprint.clone();
        let retention = self.inner.config.retention;
        let sleep = self.inner.clock.sleep(retention);
        tokio::spawn(async move {
            sleep.await;
            store.evict_if_unused(&key, token);
        });
    }

    fn evict_if_unused(&self, fingerprint: &Fingerprint, token: u64) {
        let mut state = self.state();
        let evict = state.entries.get(fingerprint).is_some_and(|entry| {
            entry.subscriber_count == 0 && entry.eviction_token == token && entry.in_flight.is_none()
        });
        if evict {
            state.entries.remove(fingerprint);
            state.tags.remove(fingerprint);
            debug!(fingerprint = %fingerprint, "Evicted unused entry");
        }
    }

    /// Add a subscriber to an existing entry. Returns false if there is none.
    pub fn subscribe(&self, fingerprint: &Fingerprint) -> bool {
        let mut state = self.state();
        match state.entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.subscriber_count += 1;
                entry.eviction_token += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one subscriber. The last one starts the retention timer; the
    /// in-flight request, if any, is left running.
    pub fn unsubscribe(&self, fingerprint: &Fingerprint) -> bool {
        let mut state = self.state();
        let Some(entry) = state.entries.get_mut(fingerprint) else {
            return false;
        };
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        if entry.subscriber_count == 0 && entry.in_flight.is_none() {
            self.schedule_eviction(fingerprint, entry);
        }
        true
    }

    /// Manual retry: refetch an entry regardless of its state, including a
    /// cached failure.
    pub async fn refetch(&self, fingerprint: &Fingerprint) -> Result<Arc<Value>, ApiError> {
        let in_flight = {
            let mut state = self.state();
            self.start_fetch(&mut state, fingerprint)
        };
        in_flight.await
    }

    /// Always-networked write. On success every entry providing one of
    /// `invalidates` is marked stale and refetched if still subscribed. A
    /// failed mutation leaves the cache untouched.
    pub async fn mutate<E: Endpoint>(
        &self,
        endpoint: &E,
        args: &E::Args,
        invalidates: &[Tag],
    ) -> Result<E::Output, ApiError> {
        let request = endpoint.request(args);
        let value = match self.inner.fetcher.fetch(&request).await {
            Ok(value) => value,
            Err(err) => {
                debug!(operation = endpoint.name(), error = %err, "Mutation failed, cache untouched");
                return Err(err);
            }
        };
        self.invalidate_tags(invalidates);
        decode::<E::Output>(endpoint.name(), &value)
    }

    /// Mark every provider of `tags` stale and schedule refetches for those
    /// still in use. Returns the number of entries affected.
    ///
    /// Entries still waiting on their first result have no tags to match
    /// yet; those results are checked against `tags` when they arrive.
    pub fn invalidate_tags(&self, tags: &[Tag]) -> usize {
        let mut state = self.state();
        if !tags.is_empty() && state.entries.values().any(|entry| entry.in_flight.is_some()) {
            state.invalidation_epoch += 1;
            let epoch = state.invalidation_epoch;
            state.invalidations.push((epoch, tags.to_vec()));
        }
        let affected = state.tags.require(tags);
        for fingerprint in &affected {
            let Some(entry) = state.entries.get_mut(fingerprint) else {
                continue;
            };
            entry.stale = true;
            if entry.subscriber_count > 0 || entry.in_flight.is_some() {
                // Subscribers pick the new fetch up from the entry.
                let _ = self.start_fetch(&mut state, fingerprint);
            }
        }
        if !affected.is_empty() {
            debug!(count = affected.len(), "Invalidated cache entries");
        }
        affected.len()
    }

    /// Drop every entry and tag.
    pub fn clear(&self) {
        let mut state = self.state();
        let count = state.entries.len();
        state.entries.clear();
        state.tags.clear_all();
        state.invalidations.clear();
        info!(count, "Cleared request cache");
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, fingerprint: &Fingerprint) -> Option<EntrySnapshot> {
        let state = self.state();
        let entry = state.entries.get(fingerprint)?;
        Some(EntrySnapshot {
            fingerprint: fingerprint.clone(),
            status: entry.status,
            value: entry.value.clone(),
            error: entry.error.clone(),
            tags: state.tags.tags_of(fingerprint).cloned().unwrap_or_default(),
            subscriber_count: entry.subscriber_count,
            stale: entry.stale,
            last_updated: entry.last_updated,
        })
    }
}

/// A handle that does not keep the cache alive.
#[derive(Clone)]
pub struct WeakCacheStore {
    inner: Weak<StoreInner>,
}

impl WeakCacheStore {
    pub fn upgrade(&self) -> Option<CacheStore> {
        self.inner.upgrade().map(|inner| CacheStore { inner })
    }
}

fn decode<T: for<'de> Deserialize<'de>>(operation: &str, value: &Value) -> Result<T, ApiError> {
    T::deserialize(value)
        .map_err(|e| ApiError::InvalidResponse(format!("Unexpected {} response: {}", operation, e)))
}

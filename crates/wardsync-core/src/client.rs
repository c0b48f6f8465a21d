//! The assembled sync client.
//!
//! `SyncClient` wires the request cache to an authenticated executor and a
//! session, so that callers only deal with typed endpoints, tags and
//! login/logout. Any logout (local, expired, failed refresh or another tab)
//! clears the cache.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::{
    AlwaysOnline, ApiError, Connectivity, HttpTransport, NetworkExecutor, Transport,
};
use crate::auth::{
    CheckOutcome, CheckTrigger, Credential, CredentialStore, ListenerId, MemoryStorage,
    MonitorHandle, Reauthenticator, Session, SessionBroadcaster, SessionChange, SessionMonitor,
    SessionState, Storage, StorageBroadcaster, Visibility,
};
use crate::cache::{CacheStore, Endpoint, Fingerprint, QueryEndpoint, Tag};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;

/// Collaborators for a [`SyncClient`]. Anything not supplied gets a default:
/// HTTP transport from the config, in-memory storage, storage-event
/// broadcaster, system clock and always-online connectivity.
#[derive(Default)]
pub struct SyncClientBuilder {
    config: Option<Config>,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn Storage>>,
    broadcaster: Option<Arc<dyn SessionBroadcaster>>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<Arc<dyn Connectivity>>,
}

impl SyncClientBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn SessionBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn build(self) -> Result<SyncClient> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.base_url, config.request_timeout())?),
        };
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let broadcaster = self.broadcaster.unwrap_or_else(|| {
            Arc::new(StorageBroadcaster::new(storage.clone(), config.credential_key.clone()))
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(AlwaysOnline));

        let executor = NetworkExecutor::new(transport, connectivity, clock.clone(), config.retry_policy());
        let session = Session::new(
            CredentialStore::new(storage, config.credential_key.clone()),
            broadcaster,
            clock.clone(),
        );
        let reauth = Reauthenticator::new(executor, session.clone(), config.refresh_path.clone());
        let store = CacheStore::new(Arc::new(reauth.clone()), clock, config.store_config());
        let monitor = SessionMonitor::new(session.clone(), config.monitor_config());

        let weak_store = store.downgrade();
        let listener = session.on_session_change(move |change| {
            if change.state != SessionState::Unauthenticated {
                return;
            }
            if let Some(store) = weak_store.upgrade() {
                debug!(reason = ?change.reason, "Clearing cache after logout");
                store.clear();
            }
        });

        if session.restore() {
            info!("Restored persisted session");
        }

        Ok(SyncClient {
            config,
            session,
            store,
            reauth,
            monitor,
            listener,
        })
    }
}

/// One tab's view of the remote API: cached typed reads, invalidating
/// writes, and the session they run under.
pub struct SyncClient {
    config: Config,
    session: Session,
    store: CacheStore,
    reauth: Reauthenticator,
    monitor: SessionMonitor,
    listener: ListenerId,
}

impl SyncClient {
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder::default()
    }

    /// Client with every default collaborator and configuration loaded from
    /// the config file and environment.
    pub fn from_config() -> Result<Self> {
        Self::builder().config(Config::load()?).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn fingerprint<E: Endpoint>(&self, endpoint: &E, args: &E::Args) -> Result<Fingerprint, ApiError> {
        Fingerprint::of(endpoint.name(), args)
    }

    /// Subscribing read; see [`CacheStore::query`].
    pub async fn query<E: QueryEndpoint>(&self, endpoint: &E, args: &E::Args) -> Result<E::Output, ApiError> {
        self.store.query(endpoint, args).await
    }

    pub async fn mutate<E: Endpoint>(
        &self,
        endpoint: &E,
        args: &E::Args,
        invalidates: &[Tag],
    ) -> Result<E::Output, ApiError> {
        self.store.mutate(endpoint, args, invalidates).await
    }

    pub fn subscribe(&self, fingerprint: &Fingerprint) -> bool {
        self.store.subscribe(fingerprint)
    }

    pub fn unsubscribe(&self, fingerprint: &Fingerprint) -> bool {
        self.store.unsubscribe(fingerprint)
    }

    pub async fn refetch(&self, fingerprint: &Fingerprint) -> Result<Arc<Value>, ApiError> {
        self.store.refetch(fingerprint).await
    }

    pub fn invalidate_tags(&self, tags: &[Tag]) -> usize {
        self.store.invalidate_tags(tags)
    }

    pub fn login(&self, credential: Credential) {
        self.session.login(credential);
    }

    pub fn logout(&self) -> bool {
        self.session.logout()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn is_refreshing(&self) -> bool {
        self.reauth.is_refreshing()
    }

    pub fn on_session_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SessionChange) + Send + Sync + 'static,
    {
        self.session.on_session_change(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.session.remove_listener(id)
    }

    pub fn check_session(&self) -> CheckOutcome {
        self.monitor.check(CheckTrigger::Manual)
    }

    /// Start background session checks driven by the host's page
    /// visibility.
    pub fn spawn_monitor(&self, visibility: watch::Receiver<Visibility>) -> MonitorHandle {
        self.monitor.spawn(visibility)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.session.remove_listener(self.listener);
    }
}

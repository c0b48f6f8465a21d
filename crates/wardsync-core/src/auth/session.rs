use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{info, warn};

use super::{Credential, CredentialStore, LogoutSignals, SessionBroadcaster};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    UserInitiated,
    Expired,
    RefreshFailed,
    /// Another tab logged out.
    RemoteSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionChange {
    pub state: SessionState,
    /// Increases with every login; a logout never revives an old session.
    pub session_id: u64,
    pub reason: Option<LogoutReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SessionChange) + Send + Sync>;

struct SessionInner {
    credential: RwLock<Option<Credential>>,
    store: CredentialStore,
    broadcaster: Arc<dyn SessionBroadcaster>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SessionState>,
    session_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

/// Process-wide holder of the credential and the authenticated state.
/// Cloning shares the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        store: CredentialStore,
        broadcaster: Arc<dyn SessionBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            inner: Arc::new(SessionInner {
                credential: RwLock::new(None),
                store,
                broadcaster,
                clock,
                state,
                session_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Rehydrate from the persisted credential. An expired or unreadable
    /// credential is ignored.
    pub fn restore(&self) -> bool {
        let credential = match self.inner.store.load() {
            Ok(Some(credential)) => credential,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted credential");
                return false;
            }
        };
        if credential.is_expired(self.inner.clock.now()) {
            info!("Persisted credential already expired");
            return false;
        }
        self.start(credential, false);
        true
    }

    pub fn login(&self, credential: Credential) {
        self.start(credential, true);
    }

    fn start(&self, credential: Credential, persist: bool) {
        if persist {
            if let Err(e) = self.inner.store.save(&credential) {
                warn!(error = %e, "Failed to persist credential");
            }
        }
        let session_id = {
            let mut current = self.write_credential();
            *current = Some(credential);
            // Bumped under the credential lock so `current` never pairs a new
            // credential with an old id.
            self.inner.session_id.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.inner.state.send_replace(SessionState::Authenticated);
        info!(session_id, "Session started");
        self.notify(SessionChange {
            state: SessionState::Authenticated,
            session_id,
            reason: None,
        });
    }

    /// Replace the credential of the current session in place. Returns false
    /// when there is no session to update.
    pub fn update_credential(&self, credential: Credential) -> bool {
        self.replace_credential(None, credential)
    }

    /// Like [`update_credential`](Self::update_credential), but only while
    /// `session_id` is still the live session.
    pub fn update_credential_if(&self, session_id: u64, credential: Credential) -> bool {
        self.replace_credential(Some(session_id), credential)
    }

    fn replace_credential(&self, expected: Option<u64>, credential: Credential) -> bool {
        let mut current = self.write_credential();
        if current.is_none() || !self.is_session(expected) {
            return false;
        }
        if let Err(e) = self.inner.store.save(&credential) {
            warn!(error = %e, "Failed to persist refreshed credential");
        }
        *current = Some(credential);
        true
    }

    pub fn logout(&self) -> bool {
        self.force_logout(LogoutReason::UserInitiated)
    }

    /// End the session. A locally caused logout clears the persisted
    /// credential and signals other tabs; one caused by another tab's signal
    /// does neither. Returns false if there was no session.
    pub fn force_logout(&self, reason: LogoutReason) -> bool {
        self.end(None, reason)
    }

    /// Like [`force_logout`](Self::force_logout), but leaves a session other
    /// than `session_id` alone.
    pub fn force_logout_if(&self, session_id: u64, reason: LogoutReason) -> bool {
        self.end(Some(session_id), reason)
    }

    fn end(&self, expected: Option<u64>, reason: LogoutReason) -> bool {
        let session_id = {
            let mut current = self.write_credential();
            if current.is_none() || !self.is_session(expected) {
                return false;
            }
            *current = None;
            self.session_id()
        };

        if reason != LogoutReason::RemoteSignal {
            if let Err(e) = self.inner.store.clear() {
                warn!(error = %e, "Failed to clear persisted credential");
            }
            self.inner.broadcaster.signal_logout();
        }
        self.inner.state.send_replace(SessionState::Unauthenticated);
        warn!(session_id, ?reason, "Session ended");
        self.notify(SessionChange {
            state: SessionState::Unauthenticated,
            session_id,
            reason: Some(reason),
        });
        true
    }

    /// Caller must hold the credential lock.
    fn is_session(&self, expected: Option<u64>) -> bool {
        expected.map_or(true, |id| id == self.session_id())
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The live session's id together with its credential, read atomically.
    pub fn current(&self) -> Option<(u64, Credential)> {
        let credential = self.inner.credential.read().unwrap_or_else(PoisonError::into_inner);
        credential.as_ref().map(|c| (self.session_id(), c.clone()))
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session_id.load(Ordering::SeqCst)
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Register a callback run after every login and logout. Callbacks run
    /// on the thread that caused the change, outside any session lock.
    pub fn on_session_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SessionChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn logout_signals(&self) -> LogoutSignals {
        self.inner.broadcaster.subscribe()
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    fn notify(&self, change: SessionChange) {
        let listeners: Vec<Listener> = self.listeners().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&change);
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_credential(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credential>> {
        self.inner.credential.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryStorage, Storage, StorageBroadcaster, CREDENTIAL_KEY};
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn session_on(storage: &MemoryStorage, clock: &ManualClock) -> Session {
        let storage: Arc<dyn Storage> = Arc::new(storage.clone());
        Session::new(
            CredentialStore::new(storage.clone(), CREDENTIAL_KEY),
            Arc::new(StorageBroadcaster::new(storage, CREDENTIAL_KEY)),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_login_persists_and_notifies() {
        let storage = MemoryStorage::new();
        let session = session_on(&storage, &ManualClock::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            session.on_session_change(move |change| seen.lock().unwrap().push(*change));
        }

        session.login(Credential::new("a1", Some("r1".into()), None));

        assert!(session.is_authenticated());
        assert_eq!(session.access_token().as_deref(), Some("a1"));
        assert!(storage.get(CREDENTIAL_KEY).unwrap().is_some());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SessionChange {
                state: SessionState::Authenticated,
                session_id: 1,
                reason: None
            }]
        );
    }

    #[test]
    fn test_restore_skips_expired_credential() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::default();
        let expired = Credential::new("old", None, Some(clock.now() - Duration::minutes(1)));
        CredentialStore::new(Arc::new(storage.clone()), CREDENTIAL_KEY)
            .save(&expired)
            .unwrap();

        let session = session_on(&storage, &clock);
        assert!(!session.restore());
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_restore_rehydrates_valid_credential() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::default();
        let valid = Credential::new("a1", None, Some(clock.now() + Duration::minutes(30)));
        session_on(&storage, &clock).login(valid.clone());

        let other_tab = session_on(&storage.open_tab(), &clock);
        assert!(other_tab.restore());
        assert_eq!(other_tab.credential(), Some(valid));
    }

    #[test]
    fn test_logout_is_idempotent_and_new_login_is_new_session() {
        let storage = MemoryStorage::new();
        let session = session_on(&storage, &ManualClock::default());
        session.login(Credential::new("a1", None, None));
        let first = session.session_id();

        assert!(session.logout());
        assert!(!session.logout());
        assert!(!session.force_logout(LogoutReason::Expired));
        assert_eq!(storage.get(CREDENTIAL_KEY).unwrap(), None);

        session.login(Credential::new("a2", None, None));
        assert!(session.session_id() > first);
    }

    #[test]
    fn test_update_credential_requires_session() {
        let storage = MemoryStorage::new();
        let session = session_on(&storage, &ManualClock::default());
        assert!(!session.update_credential(Credential::new("a1", None, None)));

        session.login(Credential::new("a1", None, None));
        assert!(session.update_credential(Credential::new("a2", None, None)));
        assert_eq!(session.access_token().as_deref(), Some("a2"));
        let persisted = CredentialStore::new(Arc::new(storage), CREDENTIAL_KEY).load().unwrap();
        assert_eq!(persisted.map(|c| c.access_token).as_deref(), Some("a2"));
    }

    #[test]
    fn test_guarded_updates_only_touch_their_own_session() {
        let storage = MemoryStorage::new();
        let session = session_on(&storage, &ManualClock::default());
        session.login(Credential::new("a1", Some("rA".into()), None));
        let first = session.session_id();
        session.logout();
        session.login(Credential::new("b1", Some("rB".into()), None));
        let (second, _) = session.current().expect("logged in");
        assert_ne!(first, second);

        assert!(!session.update_credential_if(first, Credential::new("a2", None, None)));
        assert!(!session.force_logout_if(first, LogoutReason::RefreshFailed));
        assert_eq!(session.access_token().as_deref(), Some("b1"));
        let persisted = CredentialStore::new(Arc::new(storage.clone()), CREDENTIAL_KEY)
            .load()
            .unwrap();
        assert_eq!(persisted.map(|c| c.access_token).as_deref(), Some("b1"));

        assert!(session.update_credential_if(second, Credential::new("b2", None, None)));
        assert!(session.force_logout_if(second, LogoutReason::RefreshFailed));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_remote_logout_does_not_re_signal() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::default();
        let tab_a = session_on(&storage, &clock);
        let tab_b = session_on(&storage.open_tab(), &clock);
        tab_a.login(Credential::new("a1", None, None));
        assert!(tab_b.restore());

        let observer = storage.open_tab();
        let mut events = observer.events();

        tab_a.logout();
        assert!(tab_b.force_logout(LogoutReason::RemoteSignal));

        assert_eq!(events.recv().await.unwrap().new_value, None);
        let again = tokio::time::timeout(std::time::Duration::from_millis(20), events.recv()).await;
        assert!(again.is_err(), "remote logout must not emit another signal");
        assert!(!tab_b.is_authenticated());
    }

    #[test]
    fn test_remove_listener() {
        let session = session_on(&MemoryStorage::new(), &ManualClock::default());
        let calls = Arc::new(AtomicU64::new(0));
        let id = {
            let calls = calls.clone();
            session.on_session_change(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(session.remove_listener(id));
        session.login(Credential::new("a1", None, None));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

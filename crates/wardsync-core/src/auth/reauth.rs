//! Token refresh on 401, shared by every request that hits it at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Credential, LogoutReason, Session};
use crate::api::{ApiError, ApiRequest, Fetch, NetworkExecutor};

pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

type RefreshOutcome = Shared<BoxFuture<'static, Result<String, ApiError>>>;

enum RefreshState {
    Idle,
    Refreshing {
        id: u64,
        session_id: u64,
        outcome: RefreshOutcome,
    },
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    /// Seconds until the new access token expires.
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<i64>,
}

impl RefreshResponse {
    fn into_credential(self, previous_refresh: String, now: DateTime<Utc>) -> Credential {
        let refresh_token = self.refresh_token.or(Some(previous_refresh));
        let mut credential = Credential::from_tokens(self.access_token, refresh_token);
        if let Some(seconds) = self.expires_in {
            credential.expiry = Some(now + Duration::seconds(seconds));
        }
        credential
    }
}

struct ReauthInner {
    executor: NetworkExecutor,
    session: Session,
    refresh_path: String,
    state: Mutex<RefreshState>,
    next_refresh: AtomicU64,
}

/// Authenticated request execution.
///
/// Requests carry the session's bearer token. A 401 triggers one refresh of
/// the credential no matter how many requests hit it concurrently; every
/// request waiting on that refresh is replayed once with the new token. If
/// the refresh fails the session is logged out and every waiter gets
/// [`ApiError::AuthExpired`].
#[derive(Clone)]
pub struct Reauthenticator {
    inner: Arc<ReauthInner>,
}

impl Reauthenticator {
    pub fn new(executor: NetworkExecutor, session: Session, refresh_path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ReauthInner {
                executor,
                session,
                refresh_path: refresh_path.into(),
                state: Mutex::new(RefreshState::Idle),
                next_refresh: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.state(), RefreshState::Refreshing { .. })
    }

    /// A fresh access token for a request of session `session_id` that was
    /// rejected while carrying `stale`.
    async fn refresh_after(&self, session_id: u64, stale: &str) -> Result<String, ApiError> {
        let outcome = {
            let mut state = self.state();
            let running = match &*state {
                RefreshState::Refreshing {
                    session_id: owner,
                    outcome,
                    ..
                } if *owner == session_id => Some(outcome.clone()),
                _ => None,
            };
            match running {
                Some(outcome) => outcome,
                None => {
                    let (current_id, credential) =
                        self.inner.session.current().ok_or(ApiError::AuthExpired)?;
                    if current_id != session_id {
                        debug!(session_id, current_id, "Rejected request belongs to an ended session");
                        return Err(ApiError::AuthExpired);
                    }
                    // Someone already refreshed since this request went out.
                    if credential.access_token != stale {
                        return Ok(credential.access_token);
                    }
                    let id = self.inner.next_refresh.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.clone().refresh(id, session_id, credential).boxed().shared();
                    *state = RefreshState::Refreshing {
                        id,
                        session_id,
                        outcome: outcome.clone(),
                    };
                    outcome
                }
            }
        };
        outcome.await
    }

    async fn refresh(self, id: u64, session_id: u64, stale: Credential) -> Result<String, ApiError> {
        debug!(refresh = id, session_id, "Refreshing credential");
        let result = self.request_credential(stale).await;
        let session = &self.inner.session;

        // The credential must change before going idle, or a 401 landing in
        // between would start a second refresh for the same stale token.
        // Either outcome applies only to the session that asked for it.
        let outcome = match result {
            Ok(credential) => {
                let token = credential.access_token.clone();
                if session.update_credential_if(session_id, credential) {
                    info!(refresh = id, session_id, "Credential refreshed");
                    Ok(token)
                } else {
                    warn!(refresh = id, session_id, "Session ended during refresh, discarding credential");
                    Err(ApiError::AuthExpired)
                }
            }
            Err(e) => {
                warn!(refresh = id, session_id, error = %e, "Credential refresh failed");
                if !session.force_logout_if(session_id, LogoutReason::RefreshFailed) {
                    debug!(refresh = id, session_id, "Session already ended");
                }
                Err(ApiError::AuthExpired)
            }
        };

        let mut state = self.state();
        if matches!(&*state, RefreshState::Refreshing { id: current, .. } if *current == id) {
            *state = RefreshState::Idle;
        }
        outcome
    }

    async fn request_credential(&self, stale: Credential) -> Result<Credential, ApiError> {
        let refresh_token = stale.refresh_token.ok_or(ApiError::AuthExpired)?;

        let request = ApiRequest::post(
            self.inner.refresh_path.clone(),
            json!({ "refresh_token": refresh_token }),
        );
        let value = self.inner.executor.execute(&request, None).await?;
        let response: RefreshResponse = serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidResponse(format!("refresh response: {}", e)))?;
        Ok(response.into_credential(refresh_token, self.inner.session.clock().now()))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Fetch for Reauthenticator {
    async fn fetch(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let sent = self
            .inner
            .session
            .current()
            .map(|(session_id, credential)| (session_id, credential.access_token));
        let token = sent.as_ref().map(|(_, token)| token.as_str());
        match self.inner.executor.execute(request, token).await {
            Err(e) if e.is_unauthorized() => {}
            other => return other,
        }

        let (session_id, stale) = sent.ok_or(ApiError::AuthExpired)?;
        let fresh = self.refresh_after(session_id, &stale).await?;
        match self.inner.executor.execute(request, Some(fresh.as_str())).await {
            Err(e) if e.is_unauthorized() => {
                warn!(path = %request.path, "Request rejected again after refresh");
                Err(ApiError::AuthExpired)
            }
            other => other,
        }
    }
}

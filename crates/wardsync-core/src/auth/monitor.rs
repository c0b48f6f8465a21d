//! Background validation of the session credential.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{LogoutReason, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// No two checks run closer together than this, whatever triggered them.
    pub min_spacing: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            min_spacing: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTrigger {
    Interval,
    BecameVisible,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Too soon after the previous check.
    Skipped,
    NoCredential,
    Valid,
    /// The credential had expired and the session was logged out.
    Expired,
}

struct MonitorInner {
    session: Session,
    config: MonitorConfig,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

/// Logs the session out when its credential expires, and when another tab
/// logs out.
#[derive(Clone)]
pub struct SessionMonitor {
    inner: Arc<MonitorInner>,
}

impl SessionMonitor {
    pub fn new(session: Session, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                session,
                config,
                last_check: Mutex::new(None),
            }),
        }
    }

    pub fn check(&self, trigger: CheckTrigger) -> CheckOutcome {
        let session = &self.inner.session;
        let Some((session_id, credential)) = session.current() else {
            return CheckOutcome::NoCredential;
        };

        let now = session.clock().now();
        {
            let mut last_check = self.inner.last_check.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last_check {
                let since = (now - previous).to_std().unwrap_or(Duration::ZERO);
                if since < self.inner.config.min_spacing {
                    debug!(?trigger, since_ms = since.as_millis() as u64, "Session check skipped");
                    return CheckOutcome::Skipped;
                }
            }
            *last_check = Some(now);
        }

        if credential.is_expired(now) {
            info!(?trigger, "Credential expired, logging out");
            session.force_logout_if(session_id, LogoutReason::Expired);
            CheckOutcome::Expired
        } else {
            debug!(?trigger, "Credential still valid");
            CheckOutcome::Valid
        }
    }

    /// Run checks on the interval and whenever `visibility` goes from hidden
    /// to visible, and log out when another tab signals a logout.
    pub fn spawn(&self, visibility: watch::Receiver<Visibility>) -> MonitorHandle {
        let monitor = self.clone();
        MonitorHandle {
            task: tokio::spawn(monitor.run(visibility)),
        }
    }

    async fn run(self, mut visibility: watch::Receiver<Visibility>) {
        let session = self.inner.session.clone();
        let interval = self.inner.config.interval;
        let mut signals = session.logout_signals();
        let mut signals_open = true;
        let mut visibility_open = true;
        let mut shown = *visibility.borrow_and_update();
        let mut tick = session.clock().sleep(interval);

        loop {
            tokio::select! {
                _ = &mut tick => {
                    self.check(CheckTrigger::Interval);
                    tick = session.clock().sleep(interval);
                }
                changed = visibility.changed(), if visibility_open => {
                    if changed.is_err() {
                        visibility_open = false;
                        continue;
                    }
                    let now_shown = *visibility.borrow_and_update();
                    if shown == Visibility::Hidden && now_shown == Visibility::Visible {
                        self.check(CheckTrigger::BecameVisible);
                    }
                    shown = now_shown;
                }
                signal = signals.recv(), if signals_open => match signal {
                    Some(()) => {
                        session.force_logout(LogoutReason::RemoteSignal);
                    }
                    None => signals_open = false,
                },
            }
        }
    }
}

/// Stops the monitor loop when stopped or dropped.
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

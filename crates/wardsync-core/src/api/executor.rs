//! Request execution with bounded retry for transient network failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, ApiRequest, Connectivity, Transport};
use crate::clock::Clock;

/// Attempts per request, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after failed attempt `n` is `backoff_unit * 2^n`.
    pub backoff_unit: Duration,
    /// Pause after connectivity returns before retrying.
    pub settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: Duration::from_secs(1),
            settle_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Retry bookkeeping for one request.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    failed_attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failed_attempts: 0,
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Record a failed attempt and decide what happens next.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failed_attempts += 1;
        if self.failed_attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        let factor = 2u32.saturating_pow(self.failed_attempts);
        RetryDecision::RetryAfter(self.policy.backoff_unit.saturating_mul(factor))
    }
}

/// Executes a request with whatever credentials and recovery apply.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

/// Runs requests through a [`Transport`], retrying transient network
/// failures. Every other outcome is returned unchanged.
#[derive(Clone)]
pub struct NetworkExecutor {
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl NetworkExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            connectivity,
            clock,
            policy,
        }
    }

    pub async fn execute(&self, request: &ApiRequest, token: Option<&str>) -> Result<Value, ApiError> {
        let mut retry = RetryState::new(self.policy);

        loop {
            let err = match self.transport.send(request, token).await {
                Err(err) if err.is_transient() => err,
                other => return other,
            };

            // Failures while offline do not consume an attempt.
            if !self.connectivity.is_online() {
                debug!(path = %request.path, "Offline, waiting for connectivity before retrying");
                self.connectivity.wait_online().await;
                self.clock.sleep(self.policy.settle_delay).await;
                continue;
            }

            match retry.record_failure() {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        path = %request.path,
                        attempt = retry.failed_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient network failure, backing off"
                    );
                    self.clock.sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(
                        path = %request.path,
                        attempts = retry.failed_attempts(),
                        error = %err,
                        "Giving up after repeated network failures"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Unauthenticated execution, for public endpoints.
#[async_trait]
impl Fetch for NetworkExecutor {
    async fn fetch(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        self.execute(request, None).await
    }
}

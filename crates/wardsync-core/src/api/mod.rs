//! Network access for the sync layer.
//!
//! This module provides the `NetworkExecutor`, which sends `ApiRequest`s
//! through a pluggable `Transport` and retries transient network failures
//! with exponential backoff, pausing while the host is offline.
//!
//! The default transport speaks JSON over HTTP to the configured base URL
//! and authenticates with a bearer token.

pub mod connectivity;
pub mod error;
pub mod executor;
pub mod request;
pub mod transport;

pub use connectivity::{AlwaysOnline, Connectivity, ConnectivityMonitor};
pub use error::ApiError;
pub use executor::{Fetch, NetworkExecutor, RetryDecision, RetryPolicy, RetryState};
pub use request::{ApiRequest, Method};
pub use transport::{HttpTransport, Transport};

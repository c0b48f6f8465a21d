//! Transport seam between the sync layer and the network.
//!
//! The executor only ever talks to a [`Transport`]; `HttpTransport` is the
//! production implementation on top of `reqwest`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Url};
use serde_json::Value;
use tracing::debug;

use super::{ApiError, ApiRequest};

/// Perform a single request attempt. No retrying, no reauthentication.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<Value, ApiError>;
}

/// JSON-over-HTTP transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Self::parse_base_url(base_url)?;
        Ok(Self { client, base_url })
    }

    /// Parse the base URL, forcing a trailing slash so relative joins keep
    /// the full base path.
    fn parse_base_url(base_url: &str) -> Result<Url> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        Url::parse(&normalized).with_context(|| format!("Invalid API base URL: {}", base_url))
    }

    fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Validation(format!("Invalid request path {}: {}", path, e)))
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status.as_u16(), &body))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<Value, ApiError> {
        let url = self.url_for(&request.path)?;
        debug!(method = ?request.method, url = %url, "Sending request");

        let mut builder = self
            .client
            .request(request.method.as_reqwest(), url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = Self::check_response(builder.send().await?).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

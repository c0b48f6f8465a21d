//! Shared doubles for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{ApiError, ApiRequest, Transport};

type Handler = Arc<dyn Fn(Option<&str>) -> Result<Value, ApiError> + Send + Sync>;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Result<Value, ApiError>>>,
    handlers: HashMap<String, Handler>,
    calls: HashMap<String, Vec<Option<String>>>,
    bodies: HashMap<String, Vec<Option<Value>>>,
}

/// Transport answering from per-path scripts.
///
/// Queued responses are used first, then the path's handler; a path with
/// neither answers 404. Every call records the bearer token it carried.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, path: &str, response: Result<Value, ApiError>) {
        self.script
            .lock()
            .unwrap()
            .queued
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn respond(&self, path: &str, response: Result<Value, ApiError>) {
        self.handle(path, move |_| response.clone());
    }

    pub fn handle<F>(&self, path: &str, handler: F)
    where
        F: Fn(Option<&str>) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        self.script
            .lock()
            .unwrap()
            .handlers
            .insert(path.to_string(), Arc::new(handler));
    }

    /// Make every call wait this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self, path: &str) -> usize {
        self.tokens(path).len()
    }

    pub fn tokens(&self, path: &str) -> Vec<Option<String>> {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn bodies(&self, path: &str) -> Vec<Option<Value>> {
        self.script
            .lock()
            .unwrap()
            .bodies
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<Value, ApiError> {
        {
            let mut script = self.script.lock().unwrap();
            script
                .calls
                .entry(request.path.clone())
                .or_default()
                .push(token.map(str::to_string));
            script
                .bodies
                .entry(request.path.clone())
                .or_default()
                .push(request.body.clone());
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handler = {
            let mut script = self.script.lock().unwrap();
            if let Some(response) = script
                .queued
                .get_mut(&request.path)
                .and_then(VecDeque::pop_front)
            {
                return response;
            }
            script.handlers.get(&request.path).cloned()
        };
        match handler {
            Some(handler) => handler(token),
            None => Err(ApiError::from_status(404, "no scripted response")),
        }
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

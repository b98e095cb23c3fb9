//! Scripted HTTP gateway shared by the relay integration tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use strata_relay::{GatewayError, HttpGateway};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub bearer: Option<String>,
}

/// Replays queued responses per URL prefix and records every call.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, GatewayError>>>>,
    healthy: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for any POST whose URL starts with `prefix`.
    pub fn queue(&self, prefix: &str, response: Result<Value, GatewayError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(prefix.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn queue_err(&self, prefix: &str, message: &str) {
        self.queue(prefix, Err(GatewayError::Http(message.to_string())));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded POSTs whose URL starts with `prefix`.
    pub fn calls_to(&self, prefix: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.url.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl HttpGateway for ScriptedGateway {
    async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        _body: &Value,
        _timeout: Duration,
    ) -> Result<Value, GatewayError> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            bearer: bearer.map(str::to_string),
        });
        let mut responses = self.responses.lock().unwrap();
        let queue = responses
            .iter_mut()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, queue)| queue)
            .next();
        match queue.and_then(|q| q.pop_front()) {
            Some(response) => response,
            None => Err(GatewayError::Http(format!("no scripted response for {url}"))),
        }
    }

    async fn get_ok(&self, _url: &str, _timeout: Duration) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

//! Thin HTTP seam so the router and monitor are testable without a
//! network. The production implementation is a shared reqwest client.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(String),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("response decode failed: {0}")]
    Decode(String),
}

#[async_trait]
pub trait HttpGateway: Send + Sync {
    /// POST a JSON body, optionally with a bearer token, and decode the
    /// JSON response. Non-2xx statuses are errors.
    async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError>;

    /// Health probe: `true` iff the endpoint answered 2xx within the
    /// timeout. Connection failures are a healthy=false answer, not an
    /// error.
    async fn get_ok(&self, url: &str, timeout: Duration) -> bool;
}

pub struct ReqwestGateway {
    client: reqwest::Client,
}

impl ReqwestGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpGateway for ReqwestGateway {
    async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let mut request = self.client.post(url).timeout(timeout).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn get_ok(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

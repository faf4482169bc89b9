//! HTTP transport to the interception stub.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{RelayResponse, Transport, TransportError};
use crate::config::RelayConfig;

/// Transport that POSTs JSON to the stub's invoke URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
    auth: Option<(String, String)>,
}

impl HttpTransport {
    pub fn new(config: &RelayConfig) -> Self {
        let auth = config.auth.as_deref().map(|auth| match auth.split_once(':') {
            Some((user, password)) => (user.to_string(), password.to_string()),
            None => (auth.to_string(), String::new()),
        });
        Self {
            client: Client::new(),
            url: config.url.clone(),
            auth,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, body: &Value, timeout: Duration) -> Result<RelayResponse, TransportError> {
        let mut request = self.client.post(&self.url).json(body).timeout(timeout);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Network(format!("Failed to read response body: {e}"))
            }
        })?;
        debug!(status, body_len = text.len(), "Relay response");

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(RelayResponse { status, body })
    }
}

//! Transport layer for relay calls.
//!
//! The relay endpoint is a single POST used for both claim and report. The
//! `Transport` trait keeps the HTTP details out of the relay client so the
//! protocol can be driven by scripted responses.

pub mod http;
pub mod protocol;

pub use http::HttpTransport;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Status and decoded body of one relay call.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayResponse {
    pub status: u16,
    /// JSON body, or a JSON string holding the raw text when it was not JSON.
    pub body: Value,
}

impl RelayResponse {
    pub const fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),
}

/// Abstraction over the relay endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` and wait for the response, giving up after `timeout`.
    async fn post(&self, body: &Value, timeout: Duration) -> Result<RelayResponse, TransportError>;
}

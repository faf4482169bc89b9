//! Relay client for the interception stub.
//!
//! The stub holds each claim open for its own timeout window, so a retry
//! marker is answered with an immediate new claim. Give-up markers and
//! network failures back off first. Reports are retried a bounded number of
//! times before the relay is declared dead.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::invocation::{ActivationId, InvocationRequest, InvocationResult};
use crate::transport::protocol::{self, ClaimResponse};
use crate::transport::{HttpTransport, Transport, TransportError};

/// Result of a single claim call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(InvocationRequest),
    /// Nothing pending yet, including a claim that timed out client-side.
    Pending,
    /// The stub gave up waiting; back off before the next claim.
    GiveUp,
}

/// Claims invocations from the stub and reports their results.
pub struct RelayClient {
    transport: Box<dyn Transport>,
    config: RelayConfig,
}

impl RelayClient {
    /// Client talking HTTP to the configured endpoint.
    pub fn new(config: RelayConfig) -> Self {
        let transport = HttpTransport::new(&config);
        Self::with_transport(config, Box::new(transport))
    }

    pub fn with_transport(config: RelayConfig, transport: Box<dyn Transport>) -> Self {
        Self { transport, config }
    }

    /// Issue one claim call.
    pub async fn claim(&self) -> Result<ClaimOutcome, RelayError> {
        let response = match self
            .transport
            .post(&protocol::claim_body(), self.config.claim_timeout())
            .await
        {
            Ok(response) => response,
            Err(TransportError::Timeout(_)) => return Ok(ClaimOutcome::Pending),
            Err(TransportError::Network(message)) => return Err(RelayError::Transient(message)),
        };

        match protocol::parse_claim_response(&response) {
            ClaimResponse::Invocation(request) => Ok(ClaimOutcome::Claimed(request)),
            ClaimResponse::Retry => Ok(ClaimOutcome::Pending),
            ClaimResponse::GiveUp => Ok(ClaimOutcome::GiveUp),
            ClaimResponse::Unexpected(message) => Err(RelayError::Transient(message)),
        }
    }

    /// Claim until an invocation arrives, the relay is declared dead, or
    /// `cancel` fires.
    pub async fn next_invocation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InvocationRequest, RelayError> {
        let mut give_ups = 0u32;

        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(RelayError::Cancelled),
                outcome = self.claim() => outcome,
            };

            match outcome {
                Ok(ClaimOutcome::Claimed(request)) => {
                    info!(activation = %request.activation_id, "Claimed invocation");
                    return Ok(request);
                }
                Ok(ClaimOutcome::Pending) => {
                    give_ups = 0;
                    debug!("No invocation pending, claiming again");
                }
                Ok(ClaimOutcome::GiveUp) => {
                    give_ups += 1;
                    if give_ups > self.config.give_up_limit {
                        return Err(RelayError::Fatal(format!(
                            "relay gave up {give_ups} times in a row"
                        )));
                    }
                    debug!(give_ups, "Relay gave up waiting, backing off");
                    self.pause(cancel).await?;
                }
                Err(RelayError::Transient(message)) => {
                    warn!(error = %message, "Claim failed, backing off");
                    self.pause(cancel).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Report a result for a claimed activation.
    ///
    /// Returns once the stub accepted it, or fails fatally after
    /// `report_attempts` tries.
    pub async fn report(
        &self,
        activation_id: &ActivationId,
        result: &InvocationResult,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let body = protocol::report_body(activation_id, result);
        let attempts = self.config.report_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let sent = tokio::select! {
                () = cancel.cancelled() => return Err(RelayError::Cancelled),
                sent = self.transport.post(&body, self.config.report_timeout()) => sent,
            };

            match sent {
                Ok(response) if response.status == 200 => {
                    info!(activation = %activation_id, success = result.is_success(), "Reported result");
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("status {}: {}", response.status, response.body);
                }
                Err(err) => last_error = err.to_string(),
            }

            warn!(activation = %activation_id, attempt, error = %last_error, "Report failed");
            if attempt < attempts {
                self.pause(cancel).await?;
            }
        }

        Err(RelayError::Fatal(format!(
            "report for activation {activation_id} failed after {attempts} attempts: {last_error}"
        )))
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), RelayError> {
        sleep_or_cancel(self.config.backoff(), cancel).await
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), RelayError> {
    tokio::select! {
        () = cancel.cancelled() => Err(RelayError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

//! Relay message shapes.
//!
//! Claim: `{ "$waitForActivation": true }`. The stub answers 200 with the
//! pending invocation, or 502 carrying a retry or give-up marker.
//! Report: `{ "$activationId": <id>, ...resultFields }`.

use serde_json::{Map, Value};

use super::RelayResponse;
use crate::invocation::{ActivationId, InvocationRequest, InvocationResult};

pub const WAIT_FOR_ACTIVATION: &str = "$waitForActivation";
pub const ACTIVATION_ID: &str = "$activationId";
pub const RETRY_MARKER: &str = "$retry";
pub const GIVE_UP_MARKER: &str = "$giveUp";

/// Decoded answer to a claim call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResponse {
    Invocation(InvocationRequest),
    /// Nothing pending yet; claim again right away.
    Retry,
    /// The stub stopped waiting; back off before claiming again.
    GiveUp,
    Unexpected(String),
}

pub fn claim_body() -> Value {
    Value::Object(Map::from_iter([(
        WAIT_FOR_ACTIVATION.to_string(),
        Value::Bool(true),
    )]))
}

pub fn report_body(activation_id: &ActivationId, result: &InvocationResult) -> Value {
    let mut body = result.to_fields();
    body.insert(
        ACTIVATION_ID.to_string(),
        Value::String(activation_id.to_string()),
    );
    Value::Object(body)
}

pub fn parse_claim_response(response: &RelayResponse) -> ClaimResponse {
    let body = unwrap_activation_record(&response.body);

    match response.status {
        200 => parse_invocation(body).map_or_else(
            || ClaimResponse::Unexpected(format!("claim response without activation id: {body}")),
            ClaimResponse::Invocation,
        ),
        502 if has_marker(body, GIVE_UP_MARKER) => ClaimResponse::GiveUp,
        502 if has_marker(body, RETRY_MARKER) => ClaimResponse::Retry,
        status => ClaimResponse::Unexpected(format!("claim failed with status {status}: {body}")),
    }
}

/// The stub's result, whether or not it arrived wrapped in an activation record.
fn unwrap_activation_record(body: &Value) -> &Value {
    body.pointer("/response/result").unwrap_or(body)
}

fn has_marker(body: &Value, marker: &str) -> bool {
    body.get(marker).and_then(Value::as_bool).unwrap_or(false)
}

/// Accepts `{ "$activationId", ...params }` and `{ "activationId", "params" }`.
fn parse_invocation(body: &Value) -> Option<InvocationRequest> {
    let object = body.as_object()?;

    if let Some(id) = object.get(ACTIVATION_ID).and_then(Value::as_str) {
        let params = object
            .iter()
            .filter(|(key, _)| !key.starts_with('$'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        return Some(InvocationRequest {
            activation_id: ActivationId::new(id),
            params,
        });
    }

    let id = object.get("activationId").and_then(Value::as_str)?;
    let params = object
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Some(InvocationRequest {
        activation_id: ActivationId::new(id),
        params,
    })
}

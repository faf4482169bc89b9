//! Invocation data passed between the relay and the sandbox.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Correlation id the platform assigns to one invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivationId(String);

impl ActivationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One claimed function call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub activation_id: ActivationId,
    pub params: Map<String, Value>,
}

/// Why a local execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The function threw or returned an error shape.
    Function,
    /// The function did not finish within the invoke timeout.
    Timeout,
    /// The sandbox could not run the function at all.
    Sandbox,
}

/// Outcome of a local execution, reported back through the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Success(Value),
    Failure { kind: FailureKind, message: String },
}

impl InvocationResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Result fields as sent to the platform.
    ///
    /// Success values that are not objects are wrapped under `result`.
    pub fn to_fields(&self) -> Map<String, Value> {
        match self {
            Self::Success(Value::Object(fields)) => fields.clone(),
            Self::Success(other) => Map::from_iter([("result".to_string(), other.clone())]),
            Self::Failure { kind, message } => Map::from_iter([(
                "error".to_string(),
                json!({ "kind": kind, "message": message }),
            )]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_object_fields_pass_through() {
        let result = InvocationResult::Success(json!({ "msg": "CORRECT", "input": "x" }));
        assert_eq!(Value::Object(result.to_fields()), json!({ "msg": "CORRECT", "input": "x" }));
    }

    #[test]
    fn scalar_success_is_wrapped() {
        let result = InvocationResult::Success(json!(42));
        assert_eq!(Value::Object(result.to_fields()), json!({ "result": 42 }));
    }

    #[test]
    fn failure_carries_kind_and_message() {
        let result = InvocationResult::failure(FailureKind::Timeout, "took too long");
        assert!(!result.is_success());
        assert_eq!(
            Value::Object(result.to_fields()),
            json!({ "error": { "kind": "timeout", "message": "took too long" } })
        );
    }
}

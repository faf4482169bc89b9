//! Error taxonomy for the debugger core.
//!
//! Each component fails with its own error type so the orchestrator can decide
//! what is fatal to the session and what only fails a single attempt.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Source resolution failures. Fatal to `start`, fail-soft during reload.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("entry file not found: {}", .0.display())]
    EntryNotFound(PathBuf),

    #[error("entry file {} is outside project root {}", .entry.display(), .root.display())]
    EntryOutsideRoot { entry: PathBuf, root: PathBuf },

    #[error("local dependency '{specifier}' required by {} not found", .from.display())]
    MissingDependency { specifier: String, from: PathBuf },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to package sources: {0}")]
    Archive(#[source] std::io::Error),
}

/// Build step failures. Only the current reload attempt is affected.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build command exited with {}: {stderr}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("build command timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn build command: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Relay protocol failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Network hiccup or unexpected response; retried while the session runs.
    #[error("transient relay failure: {0}")]
    Transient(String),

    /// Retries exhausted; the session cannot continue.
    #[error("fatal relay failure: {0}")]
    Fatal(String),

    /// The claim or report was abandoned because the session is stopping.
    #[error("relay call cancelled")]
    Cancelled,
}

/// Sandbox lifecycle failures.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to start sandbox: {0}")]
    Start(String),

    #[error("failed to mount payload: {0}")]
    Mount(#[source] std::io::Error),

    #[error("sandbox runtime error: {0}")]
    Runtime(String),

    #[error("invocation timed out after {0:?}")]
    InvokeTimeout(Duration),

    #[error("sandbox is not running")]
    NotRunning,
}

/// Orchestrator-level failures.
#[derive(Debug, Error)]
pub enum DebuggerError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::debugger::DebuggerState,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("failed to install interception: {0}")]
    Interception(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_message_includes_exit_code() {
        let err = BuildError::Failed {
            exit_code: Some(2),
            stderr: "syntax error".to_string(),
        };
        assert_eq!(err.to_string(), "build command exited with 2: syntax error");

        let err = BuildError::Failed {
            exit_code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn missing_dependency_names_importer() {
        let err = ResolutionError::MissingDependency {
            specifier: "./lib".to_string(),
            from: PathBuf::from("/p/index.js"),
        };
        assert_eq!(
            err.to_string(),
            "local dependency './lib' required by /p/index.js not found"
        );
    }
}

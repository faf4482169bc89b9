//! Installing and removing the interception stub on the remote platform.
//!
//! Deploying the stub is outside this crate; it is driven through
//! user-supplied commands. `restore` must return the remote action to its
//! original, non-intercepted state.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::builder::BuildRunner;
use crate::config::{BuildConfig, InterceptionConfig};

/// Time allowed for an install or restore command.
const COMMAND_TIMEOUT_SECS: u64 = 120;

#[async_trait]
pub trait Interception: Send + Sync {
    /// Replace the remote action with the relay stub.
    async fn install(&self) -> Result<()>;

    /// Put the original action back.
    async fn restore(&self) -> Result<()>;
}

/// For stubs managed entirely outside the debugger.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInterception;

#[async_trait]
impl Interception for NoInterception {
    async fn install(&self) -> Result<()> {
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs configured shell commands in the project root.
#[derive(Debug, Clone)]
pub struct CommandInterception {
    config: InterceptionConfig,
    project_root: PathBuf,
}

impl CommandInterception {
    pub const fn new(config: InterceptionConfig, project_root: PathBuf) -> Self {
        Self {
            config,
            project_root,
        }
    }

    async fn run(&self, command: Option<&str>, what: &str) -> Result<()> {
        let Some(command) = command else {
            return Ok(());
        };
        let step = BuildConfig {
            command: command.to_string(),
            artifact_path: None,
            timeout_seconds: COMMAND_TIMEOUT_SECS,
        };
        BuildRunner
            .run(&step, &self.project_root)
            .await
            .with_context(|| format!("Interception {what} command failed"))?;
        info!(command = %command, "Interception {what} completed");
        Ok(())
    }
}

#[async_trait]
impl Interception for CommandInterception {
    async fn install(&self) -> Result<()> {
        self.run(self.config.install_command.as_deref(), "install").await
    }

    async fn restore(&self) -> Result<()> {
        self.run(self.config.restore_command.as_deref(), "restore").await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_run_in_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let interception = CommandInterception::new(
            InterceptionConfig {
                install_command: Some("echo installed > state".to_string()),
                restore_command: Some("echo restored > state".to_string()),
            },
            dir.path().to_path_buf(),
        );

        interception.install().await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("state")).unwrap(), "installed\n");

        interception.restore().await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("state")).unwrap(), "restored\n");
    }

    #[tokio::test]
    async fn missing_commands_are_no_ops_and_failures_surface() {
        let dir = tempfile::tempdir().unwrap();
        let interception = CommandInterception::new(
            InterceptionConfig {
                install_command: None,
                restore_command: Some("exit 1".to_string()),
            },
            dir.path().to_path_buf(),
        );

        assert!(interception.install().await.is_ok());
        let err = interception.restore().await.unwrap_err();
        assert!(err.to_string().contains("restore"));
    }
}

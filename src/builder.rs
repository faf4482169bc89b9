//! External build step.
//!
//! The build command is opaque: only its exit status matters. On success the
//! configured artifact path is returned as-is; the resolver's read is what
//! reports a missing artifact.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::BuildConfig;
use crate::error::BuildError;

/// Runs the configured build command.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildRunner;

impl BuildRunner {
    /// Run the build in `project_root` and return the artifact to resolve.
    ///
    /// Without an artifact path the caller keeps its own entry file, so
    /// `Ok(None)` is returned.
    #[instrument(skip(self, config), fields(command = %config.command, timeout = config.timeout_seconds))]
    pub async fn run(
        &self,
        config: &BuildConfig,
        project_root: &Path,
    ) -> Result<Option<PathBuf>, BuildError> {
        debug!("Running build command");

        let mut child = shell(&config.command)
            .current_dir(project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BuildError::Spawn)?;

        // Take the pipe so `child` stays available for kill-on-timeout.
        let mut child_stderr = child.stderr.take();
        let run = async {
            let mut stderr_buf = Vec::new();
            if let Some(stderr) = child_stderr.as_mut() {
                stderr
                    .read_to_end(&mut stderr_buf)
                    .await
                    .map_err(BuildError::Spawn)?;
            }
            let status = child.wait().await.map_err(BuildError::Spawn)?;
            Ok::<_, BuildError>((status, stderr_buf))
        };

        let outcome = tokio::time::timeout(config.timeout(), run).await;
        let Ok(result) = outcome else {
            let _ = child.kill().await;
            return Err(BuildError::Timeout(config.timeout()));
        };
        let (status, stderr_buf) = result?;

        if !status.success() {
            return Err(BuildError::Failed {
                exit_code: status.code(),
                stderr: String::from_utf8_lossy(&stderr_buf).trim().to_string(),
            });
        }

        debug!("Build completed");
        Ok(config
            .artifact_path
            .as_ref()
            .map(|artifact| project_root.join(artifact)))
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn build(command: &str, artifact: Option<&str>, timeout_seconds: u64) -> BuildConfig {
        BuildConfig {
            command: command.to_string(),
            artifact_path: artifact.map(PathBuf::from),
            timeout_seconds,
        }
    }

    #[tokio::test]
    async fn success_returns_artifact_in_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = build("mkdir -p dist && echo built > dist/out.js", Some("dist/out.js"), 10);

        let artifact = BuildRunner.run(&config, dir.path()).await.unwrap();

        let artifact = artifact.expect("artifact path should be returned");
        assert_eq!(artifact, dir.path().join("dist/out.js"));
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn artifact_path_returned_even_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = build("true", Some("never-written.js"), 10);

        let artifact = BuildRunner.run(&config, dir.path()).await.unwrap();
        assert_eq!(artifact, Some(dir.path().join("never-written.js")));
    }

    #[tokio::test]
    async fn nonzero_exit_is_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = build("echo broken >&2; exit 3", None, 10);

        let err = BuildRunner.run(&config, dir.path()).await.unwrap_err();
        match err {
            BuildError::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_build_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = build("sleep 5", None, 1);

        let started = std::time::Instant::now();
        let err = BuildRunner.run(&config, dir.path()).await.unwrap_err();

        assert!(matches!(err, BuildError::Timeout(d) if d == Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}

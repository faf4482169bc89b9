//! Docker-backed sandbox runtime.
//!
//! Containers are managed through the `docker` CLI. The runtime image is
//! expected to speak the OpenWhisk action-proxy protocol on port 8080:
//! `POST /init` loads code once, `POST /run` invokes it.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{ContainerHandle, LaunchSpec, SandboxRuntime, MOUNT_POINT};
use crate::error::ContainerError;

/// Port the action proxy listens on inside the container.
const PROXY_PORT: u16 = 8080;

/// Delay between init attempts while the proxy boots.
const INIT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Runtime using the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: String,
    client: Client,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            docker: "docker".to_string(),
            client: Client::new(),
        }
    }

    /// Arguments for `docker run`, split out so they can be inspected.
    fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "-v".to_string(),
            format!("{}:{MOUNT_POINT}", spec.mount_dir.display()),
            "-p".to_string(),
            format!("{}:{PROXY_PORT}", spec.invoke_port),
            "-p".to_string(),
            format!("{0}:{0}", spec.debug_port),
        ];

        let mut env = spec.env.clone();
        env.entry("NODE_OPTIONS".to_string())
            .or_insert_with(|| format!("--inspect=0.0.0.0:{}", spec.debug_port));
        for (name, value) in &env {
            args.push("-e".to_string());
            args.push(format!("{name}={value}"));
        }

        args.push(spec.image.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<String, ContainerError> {
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ContainerError::Runtime(format!("failed to run {}: {e}", self.docker)))?;

        if !output.status.success() {
            return Err(ContainerError::Runtime(format!(
                "{} {} failed: {}",
                self.docker,
                args.first().map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(image = %spec.image, name = %spec.name))]
    async fn launch(&self, spec: &LaunchSpec) -> Result<ContainerHandle, ContainerError> {
        let id = self
            .docker(&Self::run_args(spec))
            .await
            .map_err(|e| ContainerError::Start(e.to_string()))?;
        debug!(container = %id, "Container launched");

        Ok(ContainerHandle {
            id,
            endpoint: format!("http://127.0.0.1:{}", spec.invoke_port),
        })
    }

    async fn init(
        &self,
        handle: &ContainerHandle,
        loader: &str,
        timeout: Duration,
    ) -> Result<(), ContainerError> {
        let body = json!({
            "value": { "name": "action-debug", "main": "main", "code": loader, "binary": false }
        });
        let deadline = Instant::now() + timeout;

        // The proxy needs a moment to bind its port after the container starts.
        loop {
            let sent = self
                .client
                .post(format!("{}/init", handle.endpoint))
                .json(&body)
                .timeout(timeout)
                .send()
                .await;

            match sent {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(ContainerError::Runtime(format!("init failed with {status}: {text}")));
                }
                Err(e) if Instant::now() < deadline => {
                    debug!(error = %e, "Runtime not ready yet");
                    tokio::time::sleep(INIT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(ContainerError::Runtime(format!("init failed: {e}"))),
            }
        }
    }

    async fn run(
        &self,
        handle: &ContainerHandle,
        params: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ContainerError> {
        let response = self
            .client
            .post(format!("{}/run", handle.endpoint))
            .json(&json!({ "value": params }))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ContainerError::InvokeTimeout(timeout)
                } else {
                    ContainerError::Runtime(format!("run failed: {e}"))
                }
            })?;

        // Error results come back with a non-2xx status but a JSON body.
        response
            .json::<Value>()
            .await
            .map_err(|e| ContainerError::Runtime(format!("invalid run response: {e}")))
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        self.docker(&["rm".to_string(), "-f".to_string(), handle.id.clone()])
            .await
            .map(|_| ())
    }
}

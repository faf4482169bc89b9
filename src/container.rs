//! Local execution sandbox.
//!
//! The [`ContainerManager`] owns the running sandbox and the mounted payload.
//! Payloads are written into generation directories under a host mount; a
//! `CURRENT` pointer file, replaced by rename, selects the live generation.
//! The sandbox is initialized once with a loader that follows the pointer on
//! every invocation, so a reload never restarts the container.

mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::{SandboxConfig, SandboxEnv};
use crate::error::ContainerError;
use crate::invocation::{FailureKind, InvocationRequest, InvocationResult};
use crate::source::{SourcePayload, BOOTSTRAP_FILE};

/// Mount point of the payload directory inside the sandbox.
pub const MOUNT_POINT: &str = "/code";

/// Pointer file naming the live generation directory.
pub const CURRENT_FILE: &str = "CURRENT";

/// Init code handed to the runtime. Resolves the live generation per call.
pub const LOADER: &str = r#"const fs = require("fs");
function main(params) {
  const current = fs.readFileSync("/code/CURRENT", "utf8").trim();
  return require("/code/" + current + "/__bootstrap.js").main(params);
}
"#;

/// Everything a runtime needs to launch a sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// Host directory mounted at [`MOUNT_POINT`].
    pub mount_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub debug_port: u16,
    pub invoke_port: u16,
    pub start_timeout: Duration,
}

/// A launched sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    /// Base URL of the runtime's init/run endpoints.
    pub endpoint: String,
}

/// Container runtime driving the actual sandbox process.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Launch a sandbox with the mount and environment from `spec`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<ContainerHandle, ContainerError>;

    /// Hand the loader code to a freshly launched sandbox.
    async fn init(
        &self,
        handle: &ContainerHandle,
        loader: &str,
        timeout: Duration,
    ) -> Result<(), ContainerError>;

    /// Run the loaded function and return its raw result object.
    ///
    /// A run exceeding `timeout` fails with [`ContainerError::InvokeTimeout`].
    async fn run(
        &self,
        handle: &ContainerHandle,
        params: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ContainerError>;

    /// Stop and remove the sandbox.
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), ContainerError>;
}

/// Host side of the payload mount.
struct Mount {
    dir: PathBuf,
    generation: u64,
    // Removes the directory on drop when we created it.
    _temp: Option<tempfile::TempDir>,
}

/// Owns the sandbox handle and the currently mounted payload.
pub struct ContainerManager {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
    handle: Option<ContainerHandle>,
    mount: Option<Mount>,
    current: Option<Arc<SourcePayload>>,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            handle: None,
            mount: None,
            current: None,
        }
    }

    pub const fn handle(&self) -> Option<&ContainerHandle> {
        self.handle.as_ref()
    }

    /// The payload invocations currently run against.
    pub fn current(&self) -> Option<Arc<SourcePayload>> {
        self.current.clone()
    }

    /// Mount `payload` and launch the sandbox.
    #[instrument(skip_all, fields(entry = %payload.entry_path, image = %self.config.image))]
    pub async fn start(
        &mut self,
        payload: SourcePayload,
        env: &SandboxEnv,
    ) -> Result<ContainerHandle, ContainerError> {
        if self.handle.is_some() {
            return Err(ContainerError::Start("sandbox already running".into()));
        }

        let mut mount = self.prepare_mount()?;
        let payload = Arc::new(payload);
        mount.generation += 1;
        write_generation_blocking(mount.dir.clone(), mount.generation, Arc::clone(&payload)).await?;

        let spec = LaunchSpec {
            name: format!("action-debug-{}", std::process::id()),
            image: self.config.image.clone(),
            mount_dir: mount.dir.clone(),
            env: env.vars.clone(),
            debug_port: self.config.debug_port,
            invoke_port: self.config.invoke_port,
            start_timeout: self.config.start_timeout(),
        };

        let handle = self.runtime.launch(&spec).await?;
        if let Err(e) = self
            .runtime
            .init(&handle, LOADER, self.config.start_timeout())
            .await
        {
            if let Err(remove_err) = self.runtime.remove(&handle).await {
                warn!(error = %remove_err, "Failed to remove sandbox after init failure");
            }
            return Err(ContainerError::Start(e.to_string()));
        }

        info!(sandbox = %handle.id, mount = %mount.dir.display(), "Sandbox started");
        self.handle = Some(handle.clone());
        self.mount = Some(mount);
        self.current = Some(payload);
        Ok(handle)
    }

    /// Atomically replace the mounted payload.
    ///
    /// On error the previous payload stays mounted.
    #[instrument(skip_all, fields(entry = %payload.entry_path))]
    pub async fn reload(&mut self, payload: SourcePayload) -> Result<Arc<SourcePayload>, ContainerError> {
        if self.handle.is_none() {
            return Err(ContainerError::NotRunning);
        }
        let mount = self.mount.as_mut().ok_or(ContainerError::NotRunning)?;

        let payload = Arc::new(payload);
        let generation = mount.generation + 1;
        write_generation_blocking(mount.dir.clone(), generation, Arc::clone(&payload)).await?;
        mount.generation = generation;
        self.current = Some(Arc::clone(&payload));

        info!(generation, "Payload reloaded");
        Ok(payload)
    }

    /// Run the mounted payload against `request`.
    ///
    /// Function errors and timeouts are returned as failures, not errors.
    #[instrument(skip_all, fields(activation = %request.activation_id))]
    pub async fn invoke(&self, request: &InvocationRequest) -> InvocationResult {
        let Some(handle) = &self.handle else {
            return InvocationResult::failure(FailureKind::Sandbox, "sandbox is not running");
        };

        let outcome = self
            .runtime
            .run(handle, &request.params, self.config.invoke_timeout())
            .await;

        let result = match outcome {
            Ok(value) => interpret_result(value),
            Err(ContainerError::InvokeTimeout(timeout)) => InvocationResult::failure(
                FailureKind::Timeout,
                format!("invocation timed out after {timeout:?}"),
            ),
            Err(e) => InvocationResult::failure(FailureKind::Sandbox, e.to_string()),
        };
        debug!(success = result.is_success(), "Invocation finished");
        result
    }

    /// Remove the sandbox and its mount. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            match self.runtime.remove(&handle).await {
                Ok(()) => info!(sandbox = %handle.id, "Sandbox stopped"),
                Err(e) => warn!(sandbox = %handle.id, error = %e, "Failed to stop sandbox"),
            }
        }
        self.mount = None;
        self.current = None;
    }

    fn prepare_mount(&self) -> Result<Mount, ContainerError> {
        match &self.config.mount_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(ContainerError::Mount)?;
                Ok(Mount {
                    dir: dir.clone(),
                    generation: 0,
                    _temp: None,
                })
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("action-debug-")
                    .tempdir()
                    .map_err(ContainerError::Mount)?;
                Ok(Mount {
                    dir: temp.path().to_path_buf(),
                    generation: 0,
                    _temp: Some(temp),
                })
            }
        }
    }
}

/// A result object with an `error` field is a function failure.
fn interpret_result(value: Value) -> InvocationResult {
    match value.get("error") {
        Some(Value::String(message)) => InvocationResult::failure(FailureKind::Function, message.clone()),
        Some(error) => InvocationResult::failure(FailureKind::Function, error.to_string()),
        None => InvocationResult::Success(value),
    }
}

fn generation_name(generation: u64) -> String {
    format!("gen-{generation}")
}

async fn write_generation_blocking(
    mount: PathBuf,
    generation: u64,
    payload: Arc<SourcePayload>,
) -> Result<(), ContainerError> {
    tokio::task::spawn_blocking(move || write_generation(&mount, generation, &payload))
        .await
        .map_err(|e| ContainerError::Runtime(format!("payload writer panicked: {e}")))?
        .map_err(ContainerError::Mount)
}

/// Write `payload` into a fresh generation directory and make it live.
///
/// The pointer swap is a rename, so readers see either the old or the new
/// generation in full. Older generations are removed afterwards.
fn write_generation(mount: &Path, generation: u64, payload: &SourcePayload) -> std::io::Result<()> {
    let name = generation_name(generation);
    let dir = mount.join(&name);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;

    if payload.is_binary {
        tar::Archive::new(GzDecoder::new(payload.code.as_slice())).unpack(&dir)?;
    } else {
        let entry = dir.join(&payload.entry_path);
        if let Some(parent) = entry.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&entry, &payload.code)?;
    }
    std::fs::write(dir.join(BOOTSTRAP_FILE), &payload.bootstrap)?;

    let staging = mount.join(format!("{CURRENT_FILE}.tmp"));
    std::fs::write(&staging, &name)?;
    std::fs::rename(&staging, mount.join(CURRENT_FILE))?;

    remove_stale_generations(mount, &name);
    Ok(())
}

/// Delete every generation but `live`. The swap has already happened, so
/// failures here are only logged.
fn remove_stale_generations(mount: &Path, live: &str) {
    let entries = match std::fs::read_dir(mount) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(mount = %mount.display(), error = %e, "Failed to list old generations");
            return;
        }
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with("gen-") && file_name != live {
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "Failed to remove old generation");
            }
        }
    }
}

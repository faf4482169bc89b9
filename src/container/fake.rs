//! In-process runtime for tests.
//!
//! Instead of executing JavaScript it reports what the loader would see: the
//! live generation and every file in it. An entry containing `throw` yields
//! an error result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{ContainerHandle, LaunchSpec, SandboxRuntime, CURRENT_FILE};
use crate::error::ContainerError;
use crate::source::BOOTSTRAP_FILE;

#[derive(Clone, Default)]
pub(crate) struct FakeRuntime {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    mounts: Mutex<HashMap<String, PathBuf>>,
    last_spec: Mutex<Option<LaunchSpec>>,
    loader: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    fail_init: AtomicBool,
    launches: AtomicUsize,
    runs: AtomicUsize,
    removals: AtomicUsize,
}

impl FakeRuntime {
    pub(crate) fn launched(&self) -> Option<LaunchSpec> {
        self.inner.last_spec.lock().unwrap().clone()
    }

    pub(crate) fn loader(&self) -> Option<String> {
        self.inner.loader.lock().unwrap().clone()
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = delay;
    }

    pub(crate) fn fail_init(&self) {
        self.inner.fail_init.store(true, Ordering::SeqCst);
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn run_count(&self) -> usize {
        self.inner.runs.load(Ordering::SeqCst)
    }

    pub(crate) fn removed_count(&self) -> usize {
        self.inner.removals.load(Ordering::SeqCst)
    }

    fn mount_for(&self, handle: &ContainerHandle) -> Result<PathBuf, ContainerError> {
        self.inner
            .mounts
            .lock()
            .unwrap()
            .get(&handle.id)
            .cloned()
            .ok_or(ContainerError::NotRunning)
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ContainerHandle, ContainerError> {
        let n = self.inner.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ContainerHandle {
            id: format!("fake-{n}"),
            endpoint: format!("http://127.0.0.1:{}", spec.invoke_port),
        };
        self.inner
            .mounts
            .lock()
            .unwrap()
            .insert(handle.id.clone(), spec.mount_dir.clone());
        *self.inner.last_spec.lock().unwrap() = Some(spec.clone());
        Ok(handle)
    }

    async fn init(
        &self,
        _handle: &ContainerHandle,
        loader: &str,
        _timeout: Duration,
    ) -> Result<(), ContainerError> {
        if self.inner.fail_init.load(Ordering::SeqCst) {
            return Err(ContainerError::Runtime("init rejected".into()));
        }
        *self.inner.loader.lock().unwrap() = Some(loader.to_string());
        Ok(())
    }

    async fn run(
        &self,
        handle: &ContainerHandle,
        params: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ContainerError> {
        self.inner.runs.fetch_add(1, Ordering::SeqCst);
        let mount = self.mount_for(handle)?;
        let delay = *self.inner.delay.lock().unwrap();
        let params = params.clone();

        let execute = async move {
            let generation = std::fs::read_to_string(mount.join(CURRENT_FILE))
                .map_err(|e| ContainerError::Runtime(e.to_string()))?;
            tokio::time::sleep(delay).await;

            let dir = mount.join(&generation);
            let mut files = Map::new();
            collect_files(&dir, &dir, &mut files)
                .map_err(|e| ContainerError::Runtime(format!("generation vanished mid-run: {e}")))?;

            if files.values().any(|v| v.as_str().is_some_and(|s| s.contains("throw"))) {
                return Ok(json!({ "error": "boom" }));
            }
            Ok::<_, ContainerError>(json!({ "generation": generation, "files": files, "params": params }))
        };

        tokio::time::timeout(timeout, execute)
            .await
            .map_err(|_| ContainerError::InvokeTimeout(timeout))?
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        self.inner.removals.fetch_add(1, Ordering::SeqCst);
        self.inner.mounts.lock().unwrap().remove(&handle.id);
        Ok(())
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut Map<String, Value>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if path.file_name().is_some_and(|n| n != BOOTSTRAP_FILE) {
            let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
            files.insert(rel, Value::String(std::fs::read_to_string(&path)?));
        }
    }
    Ok(())
}

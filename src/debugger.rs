//! Debug session orchestration.
//!
//! The [`Debugger`] ties the pieces together: it resolves and mounts the
//! sources, then runs two background loops. The relay loop claims remote
//! invocations, runs them in the sandbox and reports results. The watch loop
//! rebuilds and remounts the sources whenever they change.
//!
//! Invocation and reload both go through the container manager's mutex, so
//! an invocation always sees one payload generation from start to finish.
//! A dead relay is fatal to the session; a failed reload is not.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::builder::BuildRunner;
use crate::config::{BuildConfig, Config, SandboxEnv};
use crate::container::{ContainerManager, DockerRuntime, SandboxRuntime};
use crate::error::{DebuggerError, RelayError};
use crate::interception::{CommandInterception, Interception, NoInterception};
use crate::invocation::{ActivationId, InvocationRequest, InvocationResult};
use crate::relay::RelayClient;
use crate::source::{resolver_for, ResolveOptions, SourcePayload, SourceResolver};
use crate::watcher::{ChangeBatch, Watcher};

/// Lifecycle of a debug session.
///
/// `Idle -> Starting -> Running -> Stopping -> Stopped`. A failed start or a
/// dead relay moves to `Failed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for DebuggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State shared between the owner and the background loops.
struct Shared {
    config: Config,
    project_root: PathBuf,
    resolver: &'static dyn SourceResolver,
    /// The single lock serializing invocations against reloads.
    containers: Mutex<ContainerManager>,
    /// Held for a whole build, resolve and swap run.
    pipeline: Mutex<()>,
    relay: Option<RelayClient>,
    interception: Arc<dyn Interception>,
    state: watch::Sender<DebuggerState>,
    cancel: CancellationToken,
    intercepted: AtomicBool,
    torn_down: Mutex<bool>,
    failure: Mutex<Option<String>>,
    local_invocations: AtomicU64,
}

/// A local debug session for one function.
pub struct Debugger {
    shared: Arc<Shared>,
    watcher: Watcher,
    tasks: Vec<JoinHandle<()>>,
}

impl Debugger {
    /// Debugger backed by Docker, the HTTP relay and command interception as
    /// configured.
    pub fn new(config: Config) -> Self {
        let relay = config.relay.clone().map(RelayClient::new);
        let interception: Arc<dyn Interception> = match &config.interception {
            Some(commands) => Arc::new(CommandInterception::new(commands.clone(), config.project_root())),
            None => Arc::new(NoInterception),
        };
        Self::with_parts(config, Arc::new(DockerRuntime::new()), relay, interception)
    }

    pub fn with_parts(
        config: Config,
        runtime: Arc<dyn SandboxRuntime>,
        relay: Option<RelayClient>,
        interception: Arc<dyn Interception>,
    ) -> Self {
        let (state, _) = watch::channel(DebuggerState::Idle);
        let watcher = Watcher::new(config.watch.debounce());
        let shared = Shared {
            project_root: config.project_root(),
            resolver: resolver_for(config.source.kind),
            containers: Mutex::new(ContainerManager::new(runtime, config.sandbox.clone())),
            pipeline: Mutex::new(()),
            relay,
            interception,
            state,
            cancel: CancellationToken::new(),
            intercepted: AtomicBool::new(false),
            torn_down: Mutex::new(false),
            failure: Mutex::new(None),
            local_invocations: AtomicU64::new(0),
            config,
        };
        Self {
            shared: Arc::new(shared),
            watcher,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> DebuggerState {
        *self.shared.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DebuggerState> {
        self.shared.state.subscribe()
    }

    /// The payload invocations currently run against.
    pub async fn current_payload(&self) -> Option<Arc<SourcePayload>> {
        self.shared.containers.lock().await.current()
    }

    /// Build, resolve and mount the sources, then launch the sandbox.
    ///
    /// Any failure here is fatal and leaves the debugger `Failed`.
    #[instrument(skip(self), fields(entry = %self.shared.config.source.entry.display()))]
    pub async fn start(&mut self) -> Result<(), DebuggerError> {
        self.shared
            .transition("start", &[DebuggerState::Idle], DebuggerState::Starting)?;

        match self.shared.launch().await {
            Ok(()) => {
                self.shared.state.send_replace(DebuggerState::Running);
                info!(root = %self.shared.project_root.display(), "Debugger running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start debugger");
                self.shared.state.send_replace(DebuggerState::Failed);
                self.shared.teardown().await;
                Err(e)
            }
        }
    }

    /// Spawn the relay and watch loops.
    pub fn run(&mut self) -> Result<(), DebuggerError> {
        let state = self.state();
        if state != DebuggerState::Running || !self.tasks.is_empty() {
            return Err(DebuggerError::InvalidState {
                operation: "run",
                state,
            });
        }

        if self.shared.relay.is_some() {
            self.tasks.push(tokio::spawn(relay_loop(Arc::clone(&self.shared))));
        } else {
            info!("No relay configured, serving local invocations only");
        }
        self.tasks
            .push(tokio::spawn(watch_loop(Arc::clone(&self.shared), self.watcher)));
        Ok(())
    }

    /// Rebuild and remount the sources now.
    ///
    /// On error the previous payload stays mounted and the session keeps
    /// running.
    pub async fn reload(&self) -> Result<Arc<SourcePayload>, DebuggerError> {
        self.shared.require_running("reload")?;
        self.shared.reload().await
    }

    /// Invoke the mounted function locally, outside the relay.
    pub async fn invoke(&self, params: Map<String, Value>) -> Result<InvocationResult, DebuggerError> {
        self.shared.require_running("invoke")?;
        Ok(self.shared.invoke_local(params).await)
    }

    /// Wait until the session ends, either through [`Debugger::stop`] or a
    /// fatal relay failure. After a relay failure this returns once teardown
    /// has finished.
    pub async fn wait(&self) -> Result<(), DebuggerError> {
        self.shared.cancel.cancelled().await;
        match self.shared.failure.lock().await.clone() {
            Some(message) => Err(RelayError::Fatal(message).into()),
            None => Ok(()),
        }
    }

    /// Stop the loops, remove the sandbox and restore interception.
    ///
    /// Safe to call in any state and more than once. A `Failed` session
    /// stays `Failed`.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) {
        if self.state() == DebuggerState::Stopped {
            return;
        }
        let _ = self.shared.transition(
            "stop",
            &[DebuggerState::Idle, DebuggerState::Running],
            DebuggerState::Stopping,
        );

        self.shared.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Debugger task panicked");
            }
        }
        self.shared.teardown().await;

        if self
            .shared
            .transition("stop", &[DebuggerState::Stopping], DebuggerState::Stopped)
            .is_ok()
        {
            info!("Debugger stopped");
        }
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn transition(
        &self,
        operation: &'static str,
        from: &[DebuggerState],
        to: DebuggerState,
    ) -> Result<(), DebuggerError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                debug!(from = %state, to = %to, "State transition");
                *state = to;
                true
            } else {
                result = Err(DebuggerError::InvalidState {
                    operation,
                    state: *state,
                });
                false
            }
        });
        result
    }

    fn require_running(&self, operation: &'static str) -> Result<(), DebuggerError> {
        let state = *self.state.borrow();
        if state == DebuggerState::Running {
            Ok(())
        } else {
            Err(DebuggerError::InvalidState { operation, state })
        }
    }

    async fn launch(&self) -> Result<(), DebuggerError> {
        let payload = self.build_and_resolve().await?;
        let env = SandboxEnv::capture(&self.config.sandbox);
        self.containers.lock().await.start(payload, &env).await?;

        self.interception
            .install()
            .await
            .map_err(|e| DebuggerError::Interception(format!("{e:#}")))?;
        self.intercepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Build when configured, then resolve the entry into a payload.
    async fn build_and_resolve(&self) -> Result<SourcePayload, DebuggerError> {
        let mut entry = self.config.entry_path();
        if let Some(build) = &self.config.build {
            if let Some(artifact) = BuildRunner.run(build, &self.project_root).await? {
                entry = artifact;
            }
        }
        let options = ResolveOptions {
            archive: self.config.source.archive,
        };
        Ok(self.resolver.resolve(&entry, &self.project_root, options)?)
    }

    /// One pipeline run at a time. Only the mount swap holds the container
    /// lock, so invocations continue while building and resolving.
    async fn reload(&self) -> Result<Arc<SourcePayload>, DebuggerError> {
        let _pipeline = self.pipeline.lock().await;
        let payload = self.build_and_resolve().await?;
        let mut containers = self.containers.lock().await;
        Ok(containers.reload(payload).await?)
    }

    async fn invoke_local(&self, params: Map<String, Value>) -> InvocationResult {
        let n = self.local_invocations.fetch_add(1, Ordering::SeqCst) + 1;
        let request = InvocationRequest {
            activation_id: ActivationId::new(format!("local-{n}")),
            params,
        };
        let result = self.containers.lock().await.invoke(&request).await;
        match &result {
            InvocationResult::Success(value) => {
                info!(activation = %request.activation_id, result = %value, "Local invocation succeeded");
            }
            InvocationResult::Failure { kind, message } => {
                warn!(activation = %request.activation_id, kind = ?kind, error = %message, "Local invocation failed");
            }
        }
        result
    }

    /// Files whose changes should trigger a reload.
    ///
    /// With a build step the artifact is never watched, since every build
    /// would rewrite it and trigger the next one.
    fn watch_targets(&self, payload: Option<&SourcePayload>) -> Vec<PathBuf> {
        let mut targets = match (&self.config.build, payload) {
            (Some(build), _) => self.build_inputs(build),
            (None, Some(payload)) => payload.files(),
            (None, None) => vec![self.config.entry_path()],
        };
        targets.extend(self.config.watch.paths.iter().map(|p| self.project_root.join(p)));
        targets.sort();
        targets.dedup();
        targets
    }

    /// The source entry and the local files it pulls in, minus the artifact.
    fn build_inputs(&self, build: &BuildConfig) -> Vec<PathBuf> {
        let entry = self.config.entry_path();
        let mut files = match self
            .resolver
            .resolve(&entry, &self.project_root, ResolveOptions::default())
        {
            Ok(sources) => sources.files(),
            Err(e) => {
                debug!(error = %e, "Cannot trace build inputs, watching the entry only");
                vec![entry]
            }
        };
        if let Some(artifact) = &build.artifact_path {
            let artifact = self.project_root.join(artifact);
            let artifact = artifact.canonicalize().unwrap_or(artifact);
            files.retain(|file| *file != artifact);
        }
        files
    }

    async fn fail(&self, err: &RelayError) {
        error!(error = %err, "Relay lost, stopping debugger");
        let message = match err {
            RelayError::Fatal(message) => message.clone(),
            other => other.to_string(),
        };
        *self.failure.lock().await = Some(message);
        self.state.send_replace(DebuggerState::Failed);
        self.teardown().await;
        // Waiters wake only once the sandbox is gone and interception restored.
        self.cancel.cancel();
    }

    /// Release the sandbox and restore interception, once.
    async fn teardown(&self) {
        let mut torn_down = self.torn_down.lock().await;
        if *torn_down {
            return;
        }
        *torn_down = true;

        self.containers.lock().await.stop().await;
        if self.intercepted.swap(false, Ordering::SeqCst) {
            match self.interception.restore().await {
                Ok(()) => info!("Interception restored"),
                Err(e) => warn!(error = %format!("{e:#}"), "Failed to restore interception"),
            }
        }
    }
}

async fn relay_loop(shared: Arc<Shared>) {
    let Some(relay) = shared.relay.as_ref() else {
        return;
    };

    loop {
        let request = match relay.next_invocation(&shared.cancel).await {
            Ok(request) => request,
            Err(RelayError::Cancelled) => break,
            Err(e) => {
                shared.fail(&e).await;
                break;
            }
        };

        let result = shared.containers.lock().await.invoke(&request).await;

        match relay.report(&request.activation_id, &result, &shared.cancel).await {
            Ok(()) => {}
            Err(RelayError::Cancelled) => {
                warn!(activation = %request.activation_id, "Stopped before result was reported");
                break;
            }
            Err(e) => {
                shared.fail(&e).await;
                break;
            }
        }
    }
    debug!("Relay loop finished");
}

async fn watch_loop(shared: Arc<Shared>, watcher: Watcher) {
    let current = shared.containers.lock().await.current();
    let mut watched = shared.watch_targets(current.as_deref());
    let mut changes = match watcher.watch(&watched) {
        Ok(changes) => changes,
        Err(e) => {
            warn!(error = %e, "Cannot watch sources, live reload disabled");
            return;
        }
    };
    let mut pending: Option<ChangeBatch> = None;

    loop {
        let batch = match pending.take() {
            Some(batch) => batch,
            None => tokio::select! {
                () = shared.cancel.cancelled() => break,
                batch = changes.next() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            },
        };
        if shared.cancel.is_cancelled() {
            break;
        }

        info!(changed = batch.paths.len(), "Sources changed, reloading");
        let payload = match shared.reload().await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Reload failed, keeping previous payload");
                continue;
            }
        };

        // The dependency set may have changed with the sources.
        let targets = shared.watch_targets(Some(&payload));
        if targets != watched {
            match watcher.watch(&targets) {
                Ok(next) => {
                    pending = changes.take_pending();
                    changes = next;
                    watched = targets;
                }
                Err(e) => warn!(error = %e, "Failed to update watched files"),
            }
        }

        if let Some(params) = &shared.config.invoke_params {
            shared.invoke_local(params.clone()).await;
        }
    }
    debug!("Watch loop finished");
}

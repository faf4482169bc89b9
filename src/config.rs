//! Session configuration.
//!
//! Configuration is JSON, read from the `ACTION_DEBUG_CONFIG` environment
//! variable or a file, then overridden by CLI flags in `main`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::source::SourceKind;

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV_VAR: &str = "ACTION_DEBUG_CONFIG";

/// Environment variable name the platform API host override is exposed under.
pub const API_HOST_ENV_VAR: &str = "__OW_API_HOST";

/// Top-level configuration for a debugging session.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Where the action's source lives.
    pub source: SourceConfig,

    /// Optional build step run before every reload.
    #[serde(default)]
    pub build: Option<BuildConfig>,

    /// Local sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Remote relay endpoint. Without it only the reload pipeline runs.
    #[serde(default)]
    pub relay: Option<RelayConfig>,

    /// File watching settings.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Parameters for a local invocation after every successful reload.
    #[serde(default)]
    pub invoke_params: Option<Map<String, Value>>,

    /// Commands that install and remove the interception stub.
    #[serde(default)]
    pub interception: Option<InterceptionConfig>,
}

/// Entry source settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Entry file of the action.
    pub entry: PathBuf,

    /// Project root override. Defaults to the entry file's directory.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Runtime kind that decides the bundling rules.
    #[serde(default)]
    pub kind: SourceKind,

    /// Always package the payload as an archive, even without dependencies.
    #[serde(default)]
    pub archive: bool,
}

/// External build step. Its only contract is the exit status.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Shell command run in the project root.
    pub command: String,

    /// Artifact used as the entry file once the build succeeds.
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,

    /// Maximum build time in seconds.
    #[serde(default = "default_build_timeout")]
    pub timeout_seconds: u64,
}

impl BuildConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            artifact_path: None,
            timeout_seconds: default_build_timeout(),
        }
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Local sandbox settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Container image providing the action runtime.
    #[serde(default = "default_image")]
    pub image: String,

    /// Port published for external debugger attachment.
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,

    /// Host port the runtime's invoke endpoint is published on.
    #[serde(default = "default_invoke_port")]
    pub invoke_port: u16,

    /// Host environment variables forwarded into the sandbox.
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,

    /// Platform API host exposed to the function.
    #[serde(default)]
    pub api_host: Option<String>,

    /// Host directory mounted into the sandbox. A temp dir when unset.
    #[serde(default)]
    pub mount_dir: Option<PathBuf>,

    /// Maximum time for a single local invocation.
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_seconds: u64,

    /// How long to wait for the runtime to accept its init call.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            debug_port: default_debug_port(),
            invoke_port: default_invoke_port(),
            passthrough_env: default_passthrough_env(),
            api_host: None,
            mount_dir: None,
            invoke_timeout_seconds: default_invoke_timeout(),
            start_timeout_seconds: default_start_timeout(),
        }
    }
}

impl SandboxConfig {
    pub const fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_seconds)
    }

    pub const fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }
}

/// Remote relay endpoint and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// URL of the interception stub's invoke endpoint.
    pub url: String,

    /// Basic auth credentials as `user:password`.
    #[serde(default)]
    pub auth: Option<String>,

    /// Client-side timeout for one claim call. Longer than the stub's own wait.
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_seconds: u64,

    /// Timeout for one report call.
    #[serde(default = "default_report_timeout")]
    pub report_timeout_seconds: u64,

    /// Sleep after a give-up marker or a network failure.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Consecutive give-up markers tolerated before the relay is declared dead.
    #[serde(default = "default_give_up_limit")]
    pub give_up_limit: u32,

    /// Attempts for a single report before it becomes fatal.
    #[serde(default = "default_report_attempts")]
    pub report_attempts: u32,
}

impl RelayConfig {
    /// A relay config with default policy for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: None,
            claim_timeout_seconds: default_claim_timeout(),
            report_timeout_seconds: default_report_timeout(),
            backoff_ms: default_backoff_ms(),
            give_up_limit: default_give_up_limit(),
            report_attempts: default_report_attempts(),
        }
    }

    pub const fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_seconds)
    }

    pub const fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_seconds)
    }

    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// File watching settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Debounce window for coalescing bursts of events.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Extra paths to watch besides the resolved sources.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            paths: Vec::new(),
        }
    }
}

impl WatchConfig {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Shell commands that install and remove the interception stub.
#[derive(Debug, Clone, Deserialize)]
pub struct InterceptionConfig {
    #[serde(default)]
    pub install_command: Option<String>,

    #[serde(default)]
    pub restore_command: Option<String>,
}

impl Config {
    /// A config with defaults for everything but the entry file.
    pub fn for_entry(entry: impl Into<PathBuf>) -> Self {
        Self {
            source: SourceConfig {
                entry: entry.into(),
                root: None,
                kind: SourceKind::default(),
                archive: false,
            },
            build: None,
            sandbox: SandboxConfig::default(),
            relay: None,
            watch: WatchConfig::default(),
            invoke_params: None,
            interception: None,
        }
    }

    /// Load configuration from the `ACTION_DEBUG_CONFIG` environment variable.
    ///
    /// Returns `Ok(None)` when the variable is not set.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(json) = std::env::var(CONFIG_ENV_VAR) else {
            return Ok(None);
        };
        let config =
            Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}"))?;
        Ok(Some(config))
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_json(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid configuration JSON")?;
        Ok(config)
    }

    /// Resolve the project root to an absolute path.
    ///
    /// Priority: explicit `source.root` > directory of the entry file.
    pub fn project_root(&self) -> PathBuf {
        let root = self.source.root.clone().unwrap_or_else(|| {
            self.source
                .entry
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        });
        absolutize(&root)
    }

    /// The entry file as an absolute path.
    pub fn entry_path(&self) -> PathBuf {
        absolutize(&self.source.entry)
    }
}

/// Environment handed to the sandbox, captured once from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxEnv {
    pub vars: BTreeMap<String, String>,
}

impl SandboxEnv {
    /// Capture the enumerated passthrough variables from the process environment.
    pub fn capture(config: &SandboxConfig) -> Self {
        Self::capture_with(config, |name| std::env::var(name).ok())
    }

    /// Capture using an explicit lookup instead of the process environment.
    pub fn capture_with(config: &SandboxConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut vars = BTreeMap::new();
        for name in &config.passthrough_env {
            if let Some(value) = lookup(name) {
                vars.insert(name.clone(), value);
            }
        }
        if let Some(host) = &config.api_host {
            vars.insert(API_HOST_ENV_VAR.to_string(), host.clone());
        }
        Self { vars }
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}

fn default_image() -> String {
    "openwhisk/action-nodejs-v20".into()
}

fn default_passthrough_env() -> Vec<String> {
    vec!["DEBUG".into(), "NODE_DEBUG".into()]
}

const fn default_debug_port() -> u16 {
    9229
}

const fn default_invoke_port() -> u16 {
    18080
}

const fn default_build_timeout() -> u64 {
    120
}

const fn default_invoke_timeout() -> u64 {
    60
}

const fn default_start_timeout() -> u64 {
    30
}

const fn default_claim_timeout() -> u64 {
    70
}

const fn default_report_timeout() -> u64 {
    30
}

const fn default_backoff_ms() -> u64 {
    2000
}

const fn default_give_up_limit() -> u32 {
    5
}

const fn default_report_attempts() -> u32 {
    3
}

const fn default_debounce_ms() -> u64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r#"{ "source": { "entry": "/work/app/index.js" } }"#;
        let config = Config::from_json(json).unwrap();

        assert_eq!(config.source.entry, PathBuf::from("/work/app/index.js"));
        assert_eq!(config.source.kind, SourceKind::NodeJs);
        assert!(!config.source.archive);
        assert!(config.build.is_none());
        assert!(config.relay.is_none());

        // Check defaults are applied
        assert_eq!(config.sandbox.image, "openwhisk/action-nodejs-v20");
        assert_eq!(config.sandbox.debug_port, 9229);
        assert_eq!(config.sandbox.passthrough_env, vec!["DEBUG", "NODE_DEBUG"]);
        assert_eq!(config.watch.debounce(), Duration::from_millis(200));
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "source": { "entry": "src/main.js", "root": "/work/app", "kind": "nodejs", "archive": true },
            "build": { "command": "npm run build", "artifact_path": "dist/main.js", "timeout_seconds": 10 },
            "sandbox": { "debug_port": 9333, "passthrough_env": ["LOG_LEVEL"], "api_host": "https://example.test" },
            "relay": { "url": "https://example.test/api/v1/namespaces/_/actions/hello", "auth": "u:p", "give_up_limit": 2 },
            "watch": { "debounce_ms": 50, "paths": ["config"] },
            "invoke_params": { "input": "x" },
            "interception": { "restore_command": "deploy.sh restore" }
        }"#;
        let config = Config::from_json(json).unwrap();

        assert!(config.source.archive);
        let build = config.build.as_ref().expect("build should be set");
        assert_eq!(build.command, "npm run build");
        assert_eq!(build.timeout(), Duration::from_secs(10));

        let relay = config.relay.as_ref().expect("relay should be set");
        assert_eq!(relay.give_up_limit, 2);
        assert_eq!(relay.report_attempts, 3);
        assert_eq!(relay.backoff(), Duration::from_secs(2));

        assert_eq!(config.sandbox.debug_port, 9333);
        assert_eq!(config.invoke_params.as_ref().unwrap()["input"], "x");
        assert_eq!(config.project_root(), PathBuf::from("/work/app"));
        assert!(config.interception.as_ref().unwrap().install_command.is_none());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let json = r#"{ "source": { "entry": "main.py", "kind": "cobol" } }"#;
        assert!(Config::from_json(json).is_err());
    }

    #[test]
    fn project_root_defaults_to_entry_dir() {
        let config = Config::for_entry("/work/app/lib/index.js");
        assert_eq!(config.project_root(), PathBuf::from("/work/app/lib"));
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.json");
        std::fs::write(&path, r#"{ "source": { "entry": "/a/b.js" } }"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.entry_path(), PathBuf::from("/a/b.js"));
    }

    #[test]
    fn sandbox_env_forwards_only_enumerated_vars() {
        let sandbox = SandboxConfig {
            passthrough_env: vec!["DEBUG".into(), "MISSING".into()],
            api_host: Some("https://host.test".into()),
            ..SandboxConfig::default()
        };
        let env = SandboxEnv::capture_with(&sandbox, |name| match name {
            "DEBUG" => Some("*".to_string()),
            "SECRET" => Some("nope".to_string()),
            _ => None,
        });

        assert_eq!(env.vars.len(), 2);
        assert_eq!(env.vars["DEBUG"], "*");
        assert_eq!(env.vars[API_HOST_ENV_VAR], "https://host.test");
        assert!(!env.vars.contains_key("MISSING"));
    }
}

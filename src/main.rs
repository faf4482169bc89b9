//! action-debug
//!
//! Runs a serverless action locally in a container, reloading it whenever its
//! sources change and serving remote invocations claimed through the relay.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use action_debug::config::{BuildConfig, Config, RelayConfig};
use action_debug::debugger::Debugger;

#[derive(Parser, Debug)]
#[command(name = "action-debug")]
#[command(about = "Debug a serverless action locally with live source reload")]
struct Args {
    /// Entry source file of the action
    entry: Option<PathBuf>,

    /// Project root (defaults to the entry's directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Shell command run before every reload
    #[arg(long)]
    build_command: Option<String>,

    /// File produced by the build, resolved instead of the entry
    #[arg(long, requires = "build_command")]
    build_artifact: Option<PathBuf>,

    /// Invocation parameter for local runs after each reload (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Debugger port published from the sandbox
    #[arg(long)]
    port: Option<u16>,

    /// Host environment variable forwarded to the sandbox (repeatable)
    #[arg(long = "env", value_name = "NAME")]
    env: Vec<String>,

    /// Relay endpoint of the interception stub
    #[arg(long)]
    relay_url: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Parse `KEY=VALUE`, reading the value as JSON when it parses as such.
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Layer CLI flags over the environment or file configuration.
fn load_config(args: Args) -> Result<Config> {
    let base = match Config::from_env()? {
        Some(config) => Some(config),
        None => args.config.as_deref().map(Config::from_file).transpose()?,
    };
    let mut config = match (base, args.entry) {
        (Some(mut config), entry) => {
            if let Some(entry) = entry {
                config.source.entry = entry;
            }
            config
        }
        (None, Some(entry)) => Config::for_entry(entry),
        (None, None) => anyhow::bail!("No entry file given and no configuration found"),
    };

    if let Some(root) = args.root {
        config.source.root = Some(root);
    }
    if let Some(command) = args.build_command {
        let build = config.build.take().unwrap_or_else(|| BuildConfig::new(""));
        config.build = Some(BuildConfig {
            command,
            artifact_path: args.build_artifact,
            ..build
        });
    }
    if !args.params.is_empty() {
        let params = config.invoke_params.get_or_insert_with(Map::new);
        params.extend(args.params);
    }
    if let Some(port) = args.port {
        config.sandbox.debug_port = port;
    }
    config.sandbox.passthrough_env.extend(args.env);
    if let Some(url) = args.relay_url {
        match &mut config.relay {
            Some(relay) => relay.url = url,
            None => config.relay = Some(RelayConfig::new(url)),
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args).context("Failed to load configuration")?;
    info!(
        entry = %config.source.entry.display(),
        image = %config.sandbox.image,
        debug_port = config.sandbox.debug_port,
        relay = config.relay.as_ref().map_or("none", |r| r.url.as_str()),
        "Loaded configuration"
    );

    let mut debugger = Debugger::new(config);
    debugger.start().await.context("Failed to start debugger")?;
    debugger.run()?;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutting down");
            Ok(())
        }
        ended = debugger.wait() => ended,
    };

    debugger.stop().await;
    outcome.context("Debug session failed")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn params_parse_json_or_fall_back_to_string() {
        assert_eq!(parse_param("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(parse_param("name=world").unwrap(), ("name".to_string(), json!("world")));
        assert_eq!(parse_param("q=a=b").unwrap(), ("q".to_string(), json!("a=b")));
        assert!(parse_param("missing").is_err());
    }

    #[test]
    fn flags_override_entry_defaults() {
        let args = Args::parse_from([
            "action-debug",
            "src/index.js",
            "--build-command",
            "npm run build",
            "--build-artifact",
            "dist/index.js",
            "--param",
            "input=x",
            "--port",
            "9300",
            "--env",
            "API_KEY",
            "--relay-url",
            "https://relay.test/stub",
        ]);
        let config = load_config(args).unwrap();

        assert_eq!(config.source.entry, PathBuf::from("src/index.js"));
        let build = config.build.unwrap();
        assert_eq!(build.command, "npm run build");
        assert_eq!(build.artifact_path, Some(PathBuf::from("dist/index.js")));
        assert_eq!(config.invoke_params.unwrap()["input"], "x");
        assert_eq!(config.sandbox.debug_port, 9300);
        assert!(config.sandbox.passthrough_env.contains(&"API_KEY".to_string()));
        assert_eq!(config.relay.unwrap().url, "https://relay.test/stub");
    }
}

// hi-agent - host-resident metric collection agent
//
// Keeps its collect tasks in sync with a central registry, runs one pipeline
// per task and ships tagged samples to the gateway.
//
// # Layout
// - `manager` syncs buckets of tasks from the registry and emits deltas
// - `store` caches buckets and tasks on disk (SQLite)
// - `pipeline` turns deltas into running collection loops
// - `crossns` / `proxy` run probes inside a pod's network namespace
// - `tags`, `script`, `output` shape and ship each round's samples
//
// # Usage
// hi-agent [run]                   run the agent (settings from HI_* variables)
// hi-agent inputProxy <action>     helper mode, executed inside a target pod
//
// Example:
// HI_REGISTRY_ADDR=registry:8080 HI_GATEWAY_ADDR=gateway:8080 HI_APIKEY=xxx hi-agent

use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod codec;
mod config;
mod cri;
mod crossns;
mod manager;
mod model;
mod output;
mod pipeline;
mod plugin;
mod proxy;
mod registry;
mod script;
mod server;
mod store;
mod tags;
mod task;

#[cfg(test)]
mod testutil;

use config::{AgentConfig, Cli, Command};
use cri::{ContainerRuntime, DockerRuntime};
use manager::TaskManager;
use pipeline::{PipelineContext, PipelineRegistry};
use plugin::{register_builtin, PluginRegistry};
use registry::HttpRegistry;
use store::TaskStore;
use tags::{HostInfo, TagResolver};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::InputProxy { action }) => {
            // stdout carries the response envelope
            init_logging(true);
            if let Err(e) = proxy::serve(&action, tokio::io::stdin(), tokio::io::stdout()).await {
                error!("inputProxy {} failed: {}", action, e);
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Run) | None => {
            init_logging(false);
            run(AgentConfig::from_args(&cli.agent)).await
        }
    }
}

/// Application entry point of the agent
///
/// 1. Validates the configuration and registers the builtin inputs
/// 2. Opens the task store and connects to the container runtime
/// 3. Starts the pipeline worker and bootstraps it from the store
/// 4. Runs the first sync, then the sync loop and the control surface
/// 5. On Ctrl+C stops the sync loop and every pipeline
async fn run(config: AgentConfig) -> Result<()> {
    info!("=== hi-agent Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate().context("Invalid agent configuration")?;
    info!(
        "Agent {} (mode {:?}, k8s {}), registry {}, apikey {}",
        config.agent_id,
        config.mode,
        config.is_k8s(),
        config.registry_url(),
        mask_secret(&config.apikey)
    );
    let config = Arc::new(config);

    register_builtin(PluginRegistry::global()).context("Failed to register builtin inputs")?;

    let runtime: Option<Arc<dyn ContainerRuntime>> = match DockerRuntime::connect() {
        Ok(runtime) => Some(Arc::new(runtime)),
        Err(e) => {
            warn!("Container runtime unavailable, pod targets will not resolve: {}", e);
            None
        }
    };

    let store = Arc::new(
        TaskStore::open(config.store_path())
            .with_context(|| format!("Failed to open task store at {}", config.store_path().display()))?,
    );
    let sink = output::create(&config.output, &config).context("Failed to create output")?;
    let registry = Arc::new(HttpRegistry::new(&config).context("Failed to create registry client")?);

    let manager = Arc::new(
        TaskManager::new(config.agent_id.clone(), store, registry).context("Failed to load cached tasks")?,
    );

    let host = HostInfo::detect();
    info!("Host {} ({})", host.hostname, host.ip);
    let ctx = Arc::new(PipelineContext {
        tags: Arc::new(TagResolver::new(config.clone(), runtime.clone(), host)),
        config: config.clone(),
        plugins: PluginRegistry::global(),
        runtime,
        output: sink,
    });
    let (pipelines, worker) = PipelineRegistry::spawn(ctx);
    manager.add_listener(pipelines.listener());

    if let Err(e) = manager.sync_once().await {
        warn!("Initial sync failed, running with cached tasks: {}", e);
    }
    let sync_loop = manager.start();

    info!("=== hi-agent Started Successfully ===");
    info!("{} task(s), {} pipeline(s)", manager.tasks_count(), pipelines.len());

    let app = server::router(manager.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown requested");
    };
    let served = server::serve(&config.http_addr, app, shutdown).await;

    manager.stop();
    if let Some(sync_loop) = sync_loop {
        let _ = sync_loop.await;
    }
    pipelines.shutdown().await;
    let _ = worker.await;
    info!("=== hi-agent Stopped ===");

    served.context("Control surface failed")
}

/// Milliseconds since the Unix epoch, the unit every sample timestamp uses.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Initializes the logging subsystem
///
/// Default level INFO, overridable with RUST_LOG. JSON lines under systemd
/// (INVOCATION_ID is set), colored text otherwise. The helper logs to stderr.
fn init_logging(helper: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if helper {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
            .init();
    } else if env::var("INVOCATION_ID").is_ok() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_level(true).with_ansi(true))
            .init();
    }
}

/// Keeps the first four characters of a secret for log lines.
fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return "<none>".to_string();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{visible}****")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abcdef123456"), "abcd****");
        assert_eq!(mask_secret("ab"), "ab****");
        assert_eq!(mask_secret(""), "<none>");
    }
}

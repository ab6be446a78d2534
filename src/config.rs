// Configuration module - command line and HI_* environment settings
//
// This module is responsible for:
// 1. Parsing the command line (every flag also reads an environment variable)
// 2. Deriving the agent-wide settings the core consumes (`AgentConfig`)
// 3. Validating that the settings needed by the chosen subcommand are present

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix of the environment variables carrying the agent's own k8s metadata.
pub const K8S_META_PREFIX: &str = "HI_K8S_META_";

/// Errors that can occur while building the agent configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(String),

    #[error("Invalid settings format: {0}")]
    InvalidSettings(String),
}

/// Deployment mode of the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AgentMode {
    /// One agent per pod, collecting for its own pod
    #[default]
    Sidecar,

    /// One agent per node; host paths are resolved under `hostfs`
    Daemonset,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "hi-agent", version, about = "Host metric collection agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub agent: AgentArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the agent (default)
    Run,

    /// Helper mode: serve one collection request from stdin inside a pod
    #[command(name = "inputProxy")]
    InputProxy {
        /// Remote handler, e.g. httpcheck or dialcheck
        action: String,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct AgentArgs {
    /// Agent identifier sent to the registry (defaults to the host name)
    #[arg(long, env = "HI_AGENT_ID")]
    pub agent_id: Option<String>,

    #[arg(long, env = "HI_APP")]
    pub app: Option<String>,

    #[arg(long, env = "HI_APIKEY")]
    pub apikey: Option<String>,

    #[arg(long, env = "HI_REGISTRY_ADDR")]
    pub registry_addr: Option<String>,

    #[arg(long, env = "HI_REGISTRY_SECURE", default_value_t = false, action = ArgAction::Set)]
    pub registry_secure: bool,

    #[arg(long, env = "HI_GATEWAY_ADDR")]
    pub gateway_addr: Option<String>,

    #[arg(long, env = "HI_GATEWAY_SECURE", default_value_t = false, action = ArgAction::Set)]
    pub gateway_secure: bool,

    #[arg(long, env = "HI_AGENT_MODE", value_enum, default_value_t = AgentMode::Sidecar)]
    pub mode: AgentMode,

    #[arg(long, env = "HI_WORKSPACE")]
    pub workspace: Option<String>,

    #[arg(long, env = "HI_CLUSTER")]
    pub cluster: Option<String>,

    /// Presence switches the agent into k8s mode
    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: Option<String>,

    /// Tenant used when a target does not carry one
    #[arg(long, env = "HI_TENANT")]
    pub tenant: Option<String>,

    #[arg(long, env = "HI_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "HI_HTTP_ADDR", default_value = "0.0.0.0:9117")]
    pub http_addr: String,

    /// Output sink name: gateway or console
    #[arg(long, env = "HI_OUTPUT", default_value = "gateway")]
    pub output: String,

    /// Helper binary path as seen from inside target containers
    #[arg(long, env = "HI_HELPER_PATH", default_value = "/sandbox/bin/hi-agent")]
    pub helper_path: String,

    #[arg(long, env = "HI_HOSTFS", default_value = "/hostfs")]
    pub hostfs: PathBuf,

    /// Comma separated tag keys never attached to metrics
    #[arg(long, env = "HI_SUPPRESSED_TAGS", value_delimiter = ',')]
    pub suppressed_tags: Vec<String>,
}

/// Agent-wide settings shared by every component.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub agent_id: String,
    pub app: String,
    pub apikey: String,
    pub registry_addr: String,
    pub registry_secure: bool,
    pub gateway_addr: String,
    pub gateway_secure: bool,
    pub mode: AgentMode,
    /// `workspace` system tag
    pub workspace: String,
    /// `cluster` system tag
    pub cluster: String,

    /// Namespace of the agent's own pod, set in k8s mode
    pub pod_namespace: Option<String>,

    pub tenant: Option<String>,
    pub data_dir: PathBuf,
    pub http_addr: String,
    pub output: String,
    pub helper_path: String,
    pub hostfs: PathBuf,
    pub suppressed_tags: Vec<String>,

    /// `HI_K8S_META_POD_NAME=x` becomes `pod_name -> x`
    pub k8s_meta: BTreeMap<String, String>,
}

impl AgentConfig {
    /// Builds the configuration from parsed arguments and the process environment.
    pub fn from_args(args: &AgentArgs) -> Self {
        Self::from_args_and_env(args, std::env::vars())
    }

    pub fn from_args_and_env(args: &AgentArgs, env: impl IntoIterator<Item = (String, String)>) -> Self {
        let agent_id = args
            .agent_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown".to_string());

        AgentConfig {
            agent_id,
            app: args.app.clone().unwrap_or_default(),
            apikey: args.apikey.clone().unwrap_or_default(),
            registry_addr: args.registry_addr.clone().unwrap_or_default(),
            registry_secure: args.registry_secure,
            gateway_addr: args.gateway_addr.clone().unwrap_or_default(),
            gateway_secure: args.gateway_secure,
            mode: args.mode,
            workspace: args.workspace.clone().unwrap_or_default(),
            cluster: args.cluster.clone().unwrap_or_default(),
            pod_namespace: args.pod_namespace.clone().filter(|ns| !ns.is_empty()),
            tenant: args.tenant.clone().filter(|t| !t.is_empty()),
            data_dir: args.data_dir.clone(),
            http_addr: args.http_addr.clone(),
            output: args.output.clone(),
            helper_path: args.helper_path.clone(),
            hostfs: args.hostfs.clone(),
            suppressed_tags: args
                .suppressed_tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            k8s_meta: scan_k8s_meta(env),
        }
    }

    /// Checks the settings the `run` subcommand cannot do without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry_addr.is_empty() {
            return Err(ConfigError::MissingRequiredSetting("HI_REGISTRY_ADDR".into()));
        }
        if self.output == "gateway" && self.gateway_addr.is_empty() {
            return Err(ConfigError::MissingRequiredSetting("HI_GATEWAY_ADDR".into()));
        }
        if self.http_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidSettings(format!(
                "HI_HTTP_ADDR is not a socket address: {}",
                self.http_addr
            )));
        }
        Ok(())
    }

    pub fn is_k8s(&self) -> bool {
        self.pod_namespace.is_some()
    }

    pub fn is_daemonset(&self) -> bool {
        self.mode == AgentMode::Daemonset
    }

    pub fn is_suppressed(&self, tag: &str) -> bool {
        self.suppressed_tags.iter().any(|t| t == tag)
    }

    pub fn registry_url(&self) -> String {
        with_scheme(&self.registry_addr, self.registry_secure)
    }

    pub fn gateway_url(&self) -> String {
        with_scheme(&self.gateway_addr, self.gateway_secure)
    }

    /// Resolves a host path; in daemonset mode the host filesystem lives under `hostfs`.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if !self.is_daemonset() {
            return path.to_path_buf();
        }
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.hostfs.join(relative)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("agent.db")
    }
}

fn with_scheme(addr: &str, secure: bool) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.contains("://") {
        return addr.to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{addr}")
}

fn scan_k8s_meta(env: impl IntoIterator<Item = (String, String)>) -> BTreeMap<String, String> {
    env.into_iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(K8S_META_PREFIX)?;
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_ascii_lowercase(), value))
        })
        .collect()
}

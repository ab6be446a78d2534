// Plugin module - input capabilities and the type-keyed input registry
//
// Every collect config names a plugin type. The registry maps the normalized
// type to a factory that builds an `Input` for one task. Inputs collect into an
// `Accumulator`; probes that must see a pod's network view additionally expose
// the `CrossNamespace` capability.
//
// # Adding a new input
// 1. Create a module implementing `Input` (and `CrossNamespace` if needed)
// 2. Register its factory in `register_builtin`

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::AgentConfig;
use crate::crossns::CrossNsError;
use crate::model::Accumulator;
use crate::task::{CollectTarget, CollectTask, TargetType};

pub mod dialcheck;
pub mod disk;
pub mod httpcheck;
pub mod load_average;
pub mod memory;

/// Errors raised while registering or instantiating inputs
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("unsupported type {0}")]
    Unsupported(String),

    #[error("duplicate plugin type {0}")]
    Duplicate(String),

    #[error("invalid {kind} config: {source}")]
    Config {
        kind: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Where a probe has to run to see the right network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkMode {
    /// In the agent process
    #[default]
    Agent,

    /// Inside the target pod's network namespace
    Pod,
}

/// One collection request handed to the helper inside a pod.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Returned untouched to `process_response`
    pub state: Option<serde_json::Value>,

    /// Remote handler name, e.g. "httpcheck"
    pub action_type: String,

    /// Opaque request bytes written to the helper's stdin
    pub request: Vec<u8>,

    /// The probe's own timeout; the exec gets a grace period on top
    pub timeout: Duration,
}

/// Collection driven through the helper binary in the target pod.
pub trait CrossNamespace: Send {
    fn network_mode(&self) -> NetworkMode;

    fn serialize_request(&mut self) -> anyhow::Result<ProxyRequest>;

    /// Receives the helper's response bytes, or the transport error that
    /// prevented getting them. Inputs may turn the error into metrics (`up=0`).
    fn process_response(
        &mut self,
        state: Option<serde_json::Value>,
        response: Result<Vec<u8>, CrossNsError>,
        acc: &mut dyn Accumulator,
    ) -> anyhow::Result<()>;
}

/// A collection plugin bound to one task.
#[async_trait]
pub trait Input: Send {
    /// Prefix applied to metric names when the task does not configure one.
    fn default_prefix(&self) -> &str {
        ""
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()>;

    fn cross_namespace(&mut self) -> Option<&mut dyn CrossNamespace> {
        None
    }

    /// Opaque state worth carrying over when the task is hot-reloaded.
    fn export_state(&self) -> Option<serde_json::Value> {
        None
    }

    fn import_state(&mut self, _state: serde_json::Value) {}

    fn debug_info(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

pub type InputFactory = Arc<dyn Fn(&CollectTask, &AgentConfig) -> anyhow::Result<Box<dyn Input>> + Send + Sync>;

/// Takes the segment after the last `.` and lowercases it.
///
/// "io.holoinsight.plugin.HttpCheck" and "httpcheck" name the same plugin.
pub fn normalize_type(kind: &str) -> String {
    kind.rsplit('.').next().unwrap_or(kind).to_lowercase()
}

/// Host a plugin should probe for a target.
///
/// Pod targets use `meta.ip`, localhost targets use "localhost". Other targets
/// return `None` and the plugin relies on its own config.
pub fn target_host(target: &CollectTarget) -> Option<String> {
    match target.target_type() {
        TargetType::Pod => target.meta_value("ip").map(str::to_string),
        TargetType::Localhost => Some("localhost".to_string()),
        _ => None,
    }
}

/// Joins a host and a port, bracketing IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Parses a duration written as "3s", "500ms", ...; empty means `default`.
pub fn parse_timeout(text: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => Ok(humantime::parse_duration(t)?),
        None => Ok(default),
    }
}

/// Insertion-ordered, append-only input registry.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<Vec<(String, InputFactory)>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry, filled once at start-up.
    pub fn global() -> &'static PluginRegistry {
        static GLOBAL: OnceLock<PluginRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PluginRegistry::new)
    }

    pub fn register<F>(&self, kind: &str, factory: F) -> Result<(), PluginError>
    where
        F: Fn(&CollectTask, &AgentConfig) -> anyhow::Result<Box<dyn Input>> + Send + Sync + 'static,
    {
        let key = normalize_type(kind);
        let mut entries = self.entries.write();
        if entries.iter().any(|(k, _)| *k == key) {
            return Err(PluginError::Duplicate(key));
        }
        entries.push((key, Arc::new(factory)));
        Ok(())
    }

    /// Builds the input for `task` from its config type.
    pub fn create(&self, task: &CollectTask, config: &AgentConfig) -> Result<Box<dyn Input>, PluginError> {
        let key = normalize_type(&task.config.kind);
        let factory = self
            .entries
            .read()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, f)| f.clone())
            .ok_or_else(|| PluginError::Unsupported(task.config.kind.clone()))?;
        factory(task, config).map_err(|source| PluginError::Config { kind: key, source })
    }

    pub fn types(&self) -> Vec<String> {
        self.entries.read().iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Registers every input shipped with the agent.
pub fn register_builtin(registry: &PluginRegistry) -> Result<(), PluginError> {
    registry.register("httpcheck", |task, _| Ok(Box::new(httpcheck::HttpCheckInput::from_task(task)?)))?;
    registry.register("dialcheck", |task, _| Ok(Box::new(dialcheck::DialCheckInput::from_task(task)?)))?;
    registry.register("memory", |_, _| Ok(Box::new(memory::MemoryInput::new())))?;
    registry.register("load", |_, _| Ok(Box::new(load_average::LoadAverageInput::new())))?;
    registry.register("disk", |_, config| Ok(Box::new(disk::DiskInput::new(config))))?;

    info!("Registered {} input plugin(s): {:?}", registry.types().len(), registry.types());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{task_with, StaticInput};

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_type("io.holoinsight.plugin.HttpCheck"), "httpcheck");
        assert_eq!(normalize_type("DialCheck"), "dialcheck");
        assert_eq!(normalize_type("foo.bar.unknown"), "unknown");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register("a.b.Static", |_, _| Ok(Box::new(StaticInput::default())))
            .unwrap();
        let err = registry
            .register("static", |_, _| Ok(Box::new(StaticInput::default())))
            .unwrap_err();
        assert!(matches!(err, PluginError::Duplicate(k) if k == "static"));
    }

    #[test]
    fn test_unknown_type_reports_original() {
        let registry = PluginRegistry::new();
        register_builtin(&registry).unwrap();
        let task = task_with("T1", "foo.bar.unknown", b"{}", "localhost");
        let err = registry.create(&task, &AgentConfig::default()).err().unwrap();
        assert_eq!(err.to_string(), "unsupported type foo.bar.unknown");
    }

    #[test]
    fn test_registry_keeps_insertion_order() {
        let registry = PluginRegistry::new();
        register_builtin(&registry).unwrap();
        assert_eq!(registry.types(), vec!["httpcheck", "dialcheck", "memory", "load", "disk"]);
    }

    #[test]
    fn test_target_host() {
        let pod = task_with("T1", "httpcheck", b"{}", "pod");
        assert_eq!(target_host(&pod.target).as_deref(), Some("10.0.0.1"));
        let local = task_with("T1", "httpcheck", b"{}", "localhost");
        assert_eq!(target_host(&local.target).as_deref(), Some("localhost"));
        let none = task_with("T1", "httpcheck", b"{}", "none");
        assert_eq!(target_host(&none.target), None);
    }

    #[test]
    fn test_host_port_brackets_ipv6() {
        assert_eq!(host_port("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(host_port("fd00::12", 80), "[fd00::12]:80");
        assert_eq!(host_port("[fd00::12]", 80), "[fd00::12]:80");
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(Some("3s"), Duration::ZERO).unwrap(), Duration::from_secs(3));
        assert_eq!(parse_timeout(None, Duration::from_secs(1)).unwrap(), Duration::from_secs(1));
        assert!(parse_timeout(Some("soon"), Duration::ZERO).is_err());
    }
}

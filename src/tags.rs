// Tag resolver - identity and topology tags for every sample
//
// Two tag sources are computed here:
// 1. Base tags, once per pipeline, from the task's `refMetas` rules
// 2. Attach tags, once per round, from the target's *current* metadata
//    (a live pod lookup for pod targets, the agent's own identity for localhost)
//
// Suppressed tags from the global config are removed from both.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::UdpSocket;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::config::AgentConfig;
use crate::cri::{ContainerRuntime, CriError, Pod};
use crate::model::Tags;
use crate::task::{CollectTarget, CollectTask, TargetType};

pub const TAG_WORKSPACE: &str = "workspace";
pub const TAG_CLUSTER: &str = "cluster";

#[derive(Error, Debug)]
pub enum TagError {
    #[error("pod {namespace}/{pod} not found")]
    NoPod { namespace: String, pod: String },

    #[error("pod target without namespace/pod meta")]
    MissingPodMeta,

    #[error("pod lookup failed: {0}")]
    Runtime(#[from] CriError),
}

/// One tag rule: where to read the value from, and what to use otherwise.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefMeta {
    /// Target meta key, or a pod path such as `labels.app`
    pub name: String,

    /// Pod label paths tried in order when `name` yields nothing
    pub labels: Vec<String>,

    pub default_value: String,
}

/// `tag_key -> RefMeta` in declaration order.
pub type RefMetas = Vec<(String, RefMeta)>;

/// Parses the `refMetas` object keeping the order it was written in.
pub fn parse_ref_metas(raw: Option<&Map<String, Value>>) -> Result<RefMetas, serde_json::Error> {
    raw.into_iter()
        .flatten()
        .map(|(key, value)| Ok((key.clone(), RefMeta::deserialize(value)?)))
        .collect()
}

/// Identity of the machine the agent runs on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub hostname: String,
    pub ip: String,
}

impl HostInfo {
    pub fn detect() -> Self {
        HostInfo {
            hostname: sysinfo::System::host_name().unwrap_or_default(),
            ip: local_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
        }
    }
}

/// Address of the interface used for outbound traffic. No packet is sent.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

pub struct TagResolver {
    config: Arc<AgentConfig>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    host: HostInfo,
}

impl TagResolver {
    pub fn new(config: Arc<AgentConfig>, runtime: Option<Arc<dyn ContainerRuntime>>, host: HostInfo) -> Self {
        TagResolver { config, runtime, host }
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// Base tags of a pipeline.
    ///
    /// When two rules produce the same tag key the first declared one wins.
    pub async fn base_tags(&self, task: &CollectTask, ref_metas: &[(String, RefMeta)]) -> Tags {
        let target = task.target.as_ref();
        let pod = if target.is_pod() && !ref_metas.is_empty() {
            match self.lookup_pod(target).await {
                Ok(pod) => Some(pod),
                Err(e) => {
                    warn!(task = %task.key, "ref meta pod lookup failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut tags = Tags::new();
        for (key, rule) in ref_metas {
            if tags.contains_key(key) {
                continue;
            }
            let value = self
                .resolve(target, pod.as_deref(), rule)
                .or_else(|| Some(rule.default_value.clone()).filter(|v| !v.is_empty()));
            if let Some(value) = value {
                tags.insert(key.clone(), value);
            }
        }

        self.suppress(&mut tags);
        self.add_system_tags(&mut tags);
        tags
    }

    fn resolve(&self, target: &CollectTarget, pod: Option<&Pod>, rule: &RefMeta) -> Option<String> {
        if let Some(value) = target.meta_value(&rule.name) {
            return Some(value.to_string());
        }
        match target.target_type() {
            TargetType::Localhost => self.local_value(&rule.name),
            TargetType::Pod => {
                let pod = pod?;
                std::iter::once(&rule.name)
                    .chain(rule.labels.iter())
                    .filter(|path| !path.is_empty())
                    .find_map(|path| pod_value(pod, path))
            }
            _ => None,
        }
    }

    fn local_value(&self, name: &str) -> Option<String> {
        let value = match name {
            "app" => self.config.app.clone(),
            "ip" => self.host.ip.clone(),
            "host" | "hostname" => self.host.hostname.clone(),
            other => self.config.k8s_meta.get(other).cloned().unwrap_or_default(),
        };
        Some(value).filter(|v| !v.is_empty())
    }

    /// `workspace` and `cluster`: always in sidecar mode, unless suppressed
    /// in daemonset mode. A ref-meta tag of the same key is kept.
    fn add_system_tags(&self, tags: &mut Tags) {
        for (key, value) in [(TAG_WORKSPACE, &self.config.workspace), (TAG_CLUSTER, &self.config.cluster)] {
            if value.is_empty() || tags.contains_key(key) {
                continue;
            }
            if !self.config.is_daemonset() || !self.config.is_suppressed(key) {
                tags.insert(key.to_string(), value.clone());
            }
        }
    }

    fn suppress(&self, tags: &mut Tags) {
        tags.retain(|key, _| !self.config.is_suppressed(key));
    }

    /// Tags describing where the target is right now.
    ///
    /// Pod targets are looked up live on every call; a pod the runtime does not
    /// know is `TagError::NoPod`.
    pub async fn attach_tags(&self, target: &CollectTarget) -> Result<Tags, TagError> {
        let mut tags = Tags::new();
        match target.target_type() {
            TargetType::Pod => {
                let pod = self.lookup_pod(target).await?;
                let fields = [
                    ("namespace", Some(pod.namespace.as_str())),
                    ("pod", Some(pod.name.as_str())),
                    ("ip", Some(pod.ip.as_str()).filter(|ip| !ip.is_empty()).or(target.meta_value("ip"))),
                    ("hostname", Some(pod.hostname.as_str())),
                    ("app", pod.app().or(target.meta_value("app"))),
                ];
                insert_non_empty(&mut tags, fields);
            }
            TargetType::Localhost => {
                for (key, value) in &self.config.k8s_meta {
                    tags.insert(key.clone(), value.clone());
                }
                let fields = [
                    ("app", Some(self.config.app.as_str())),
                    ("ip", Some(self.host.ip.as_str())),
                    ("hostname", Some(self.host.hostname.as_str())),
                    ("namespace", self.config.pod_namespace.as_deref()),
                ];
                insert_non_empty(&mut tags, fields);
            }
            _ => {}
        }
        self.suppress(&mut tags);
        Ok(tags)
    }

    async fn lookup_pod(&self, target: &CollectTarget) -> Result<Arc<Pod>, TagError> {
        let (Some(namespace), Some(pod)) = (target.meta_value("namespace"), target.meta_value("pod")) else {
            return Err(TagError::MissingPodMeta);
        };
        let runtime = self.runtime.as_ref().ok_or_else(|| TagError::NoPod {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        })?;
        runtime
            .get_pod(namespace, pod)
            .await?
            .ok_or_else(|| TagError::NoPod {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
            })
    }
}

fn insert_non_empty<'a>(tags: &mut Tags, fields: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) {
    for (key, value) in fields {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            tags.insert(key.to_string(), value.to_string());
        }
    }
}

/// Pod value for a rule path; a bare name is treated as a label name.
fn pod_value(pod: &Pod, path: &str) -> Option<String> {
    pod.lookup(path)
        .or_else(|| pod.lookup(&format!("labels.{path}")))
        .map(str::to_string)
}

// Task model - configs, targets, tasks, buckets and deltas
//
// `CollectConfig` and `CollectTarget` are immutable values shared through `Arc`
// by every task that references the same key. Replacing one means building a
// new instance, never mutating the shared one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// What to collect: plugin discriminator plus an opaque content blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectConfig {
    pub key: String,

    /// Plugin discriminator, e.g. "httpcheck" or "io.holoinsight.plugin.HttpCheck"
    #[serde(rename = "type")]
    pub kind: String,

    pub version: String,

    /// Plugin configuration, usually JSON
    #[serde(with = "crate::codec::base64_bytes", default)]
    pub content: Vec<u8>,
}

/// Where to collect from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectTarget {
    pub key: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub version: String,

    /// Recognized slots: ip, hostname, app, namespace, pod, tenant
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Target kinds the agent understands. Anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetType {
    Localhost,
    Pod,
    Container,
    SlsShard,
    None,
    Other(String),
}

impl CollectTarget {
    pub fn target_type(&self) -> TargetType {
        match self.kind.as_str() {
            "localhost" => TargetType::Localhost,
            "pod" => TargetType::Pod,
            "container" => TargetType::Container,
            "sls_shard" => TargetType::SlsShard,
            "none" | "" => TargetType::None,
            other => TargetType::Other(other.to_string()),
        }
    }

    /// Non-empty meta value for `key`.
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn is_localhost(&self) -> bool {
        self.target_type() == TargetType::Localhost
    }

    pub fn is_pod(&self) -> bool {
        self.target_type() == TargetType::Pod
    }
}

/// A config paired with a target. Replaced atomically, never edited.
#[derive(Debug, Clone)]
pub struct CollectTask {
    pub key: String,

    /// Always `config.version + "/" + target.version`
    pub version: String,

    pub config: Arc<CollectConfig>,
    pub target: Arc<CollectTarget>,
}

impl CollectTask {
    pub fn new(key: impl Into<String>, config: Arc<CollectConfig>, target: Arc<CollectTarget>) -> Self {
        let version = format!("{}/{}", config.version, target.version);
        CollectTask {
            key: key.into(),
            version,
            config,
            target,
        }
    }

    /// Whether `other` is a replacement for this task.
    ///
    /// Any difference in the config version, the target version or the target
    /// meta map counts.
    pub fn is_different_with(&self, other: &CollectTask) -> bool {
        self.config.version != other.config.version
            || self.target.version != other.target.version
            || self.target.meta != other.target.meta
    }
}

impl fmt::Display for CollectTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}

/// Server-defined partition of the task set, versioned by an opaque state token.
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    pub key: String,
    pub state: String,
    pub tasks: HashMap<String, Arc<CollectTask>>,
}

impl Bucket {
    pub fn new(key: impl Into<String>, state: impl Into<String>) -> Self {
        Bucket {
            key: key.into(),
            state: state.into(),
            tasks: HashMap::new(),
        }
    }

    pub fn insert(&mut self, task: Arc<CollectTask>) {
        self.tasks.insert(task.key.clone(), task);
    }
}

/// Task additions and removals produced by one sync round.
///
/// An updated task only shows up in `add`; listeners replace the old one by key.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub uuid: String,
    pub add: Vec<Arc<CollectTask>>,
    pub del: Vec<Arc<CollectTask>>,
}

impl Delta {
    pub fn new(uuid: impl Into<String>) -> Self {
        Delta {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.del.is_empty()
    }
}

/// Deduplicates configs and targets so that tasks sharing a key share an instance.
///
/// Instances are keyed by `(key, version)`: a different version under the same
/// key is a different value and is never merged.
#[derive(Debug, Default)]
pub struct Interner {
    configs: HashMap<(String, String), Arc<CollectConfig>>,
    targets: HashMap<(String, String), Arc<CollectTarget>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&mut self, config: CollectConfig) -> Arc<CollectConfig> {
        self.configs
            .entry((config.key.clone(), config.version.clone()))
            .or_insert_with(|| Arc::new(config))
            .clone()
    }

    pub fn target(&mut self, target: CollectTarget) -> Arc<CollectTarget> {
        self.targets
            .entry((target.key.clone(), target.version.clone()))
            .or_insert_with(|| Arc::new(target))
            .clone()
    }
}

// Registry module - the control plane the agent syncs its tasks from
//
// The core only depends on the `RegistrySync` trait and the typed response.
// `HttpRegistry` is the production transport (JSON over HTTP).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::AgentConfig;
use crate::task::{Bucket, CollectConfig, CollectTarget, CollectTask, Interner};

/// Header code meaning "apply this response".
pub const CODE_OK: i32 = 0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub code: i32,

    #[serde(default)]
    pub message: String,
}

impl ResponseHeader {
    pub fn ok() -> Self {
        ResponseHeader { code: CODE_OK, message: String::new() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Reference from a bucket to the config and target that make up a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRef {
    pub key: String,
    pub collect_config_key: String,
    pub collect_target_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketInfo {
    pub state: String,

    #[serde(default)]
    pub collect_tasks: Vec<TaskRef>,
}

/// Agent behaviour knobs piggybacked on a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfigs {
    #[serde(default)]
    pub sync_configs_interval_seconds: i64,
}

impl ControlConfigs {
    /// Sync cadence; non-positive values mean "use the default".
    pub fn sync_interval(&self) -> Option<Duration> {
        u64::try_from(self.sync_configs_interval_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub agent_id: String,

    /// Current `{bucket_key: state}` held by the agent
    pub buckets: HashMap<String, String>,
}

/// Registry answer: changed buckets only, but the full key set of assigned buckets.
///
/// Buckets whose state did not change come back with the same state and no tasks;
/// the agent never reads their task list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub header: ResponseHeader,

    #[serde(default)]
    pub buckets: HashMap<String, BucketInfo>,

    #[serde(default)]
    pub collect_configs: HashMap<String, CollectConfig>,

    #[serde(default)]
    pub collect_targets: HashMap<String, CollectTarget>,

    #[serde(default)]
    pub control_configs: Option<ControlConfigs>,
}

impl SyncResponse {
    /// Converts the response into `bucket_key -> Bucket`, interning configs and targets.
    ///
    /// Task refs pointing at a config or target missing from the response are
    /// dropped with a warning.
    pub fn into_buckets(self) -> HashMap<String, Bucket> {
        let mut interner = Interner::new();
        let configs: HashMap<String, Arc<CollectConfig>> = self
            .collect_configs
            .into_iter()
            .map(|(key, config)| (key, interner.config(config)))
            .collect();
        let targets: HashMap<String, Arc<CollectTarget>> = self
            .collect_targets
            .into_iter()
            .map(|(key, target)| (key, interner.target(target)))
            .collect();

        self.buckets
            .into_iter()
            .map(|(bucket_key, info)| {
                let mut bucket = Bucket::new(bucket_key.clone(), info.state);
                for task_ref in info.collect_tasks {
                    let (Some(config), Some(target)) = (
                        configs.get(&task_ref.collect_config_key),
                        targets.get(&task_ref.collect_target_key),
                    ) else {
                        warn!(
                            bucket = %bucket_key,
                            task = %task_ref.key,
                            "task references an unknown config or target, skipping"
                        );
                        continue;
                    };
                    bucket.insert(Arc::new(CollectTask::new(task_ref.key, config.clone(), target.clone())));
                }
                (bucket_key, bucket)
            })
            .collect()
    }
}

/// Request/response access to the registry.
#[async_trait]
pub trait RegistrySync: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> anyhow::Result<SyncResponse>;
}

/// JSON-over-HTTP registry client
pub struct HttpRegistry {
    client: reqwest::Client,
    url: String,
    apikey: String,
}

impl HttpRegistry {
    pub const SYNC_PATH: &'static str = "/api/v1/registry/agent/sync";

    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hi-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpRegistry {
            client,
            url: format!("{}{}", config.registry_url(), Self::SYNC_PATH),
            apikey: config.apikey.clone(),
        })
    }
}

#[async_trait]
impl RegistrySync for HttpRegistry {
    async fn sync(&self, request: SyncRequest) -> anyhow::Result<SyncResponse> {
        let response = self
            .client
            .post(&self.url)
            .header("apikey", &self.apikey)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<SyncResponse>().await?)
    }
}

// Test doubles shared by the unit tests of several modules

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cri::{ContainerRuntime, CriError, ExecOutput, Pod};
use crate::manager::ChangeListener;
use crate::model::{Accumulator, Metric};
use crate::output::{Extension, Output, OutputError};
use crate::plugin::Input;
use crate::registry::{BucketInfo, ResponseHeader, RegistrySync, SyncRequest, SyncResponse, TaskRef};
use crate::task::{CollectConfig, CollectTarget, CollectTask, Delta};

pub fn config(key: &str, version: &str, kind: &str) -> CollectConfig {
    CollectConfig {
        key: key.into(),
        kind: kind.into(),
        version: version.into(),
        content: b"{}".to_vec(),
    }
}

/// Pod targets point at `default/web-0` with ip 10.0.0.1.
pub fn target(key: &str, version: &str, kind: &str) -> CollectTarget {
    let meta = match kind {
        "pod" => BTreeMap::from([
            ("ip".to_string(), "10.0.0.1".to_string()),
            ("namespace".to_string(), "default".to_string()),
            ("pod".to_string(), "web-0".to_string()),
        ]),
        _ => BTreeMap::new(),
    };
    CollectTarget {
        key: key.into(),
        kind: kind.into(),
        version: version.into(),
        meta,
    }
}

pub fn task_with(key: &str, kind: &str, content: &[u8], target_kind: &str) -> CollectTask {
    let mut config = config(&format!("C-{key}"), "1", kind);
    config.content = content.to_vec();
    let target = target(&format!("V-{key}"), "1", target_kind);
    CollectTask::new(key, Arc::new(config), Arc::new(target))
}

/// Input producing a fixed batch, counting its rounds and the pipelines
/// built from it.
#[derive(Default, Clone)]
pub struct StaticInput {
    pub metrics: Vec<Metric>,
    pub prefix: String,
    pub fail: bool,
    pub panic: bool,
    pub delay: Option<Duration>,
    pub rounds: Arc<AtomicUsize>,
    pub builds: Arc<AtomicUsize>,
    pub state: Option<serde_json::Value>,
}

impl StaticInput {
    pub fn with_metrics(metrics: Vec<Metric>) -> Self {
        StaticInput {
            metrics,
            ..Default::default()
        }
    }

    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Input for StaticInput {
    fn default_prefix(&self) -> &str {
        &self.prefix
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()> {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic {
            panic!("static input panicked");
        }
        if self.fail {
            anyhow::bail!("static input failed");
        }
        for metric in &self.metrics {
            acc.add_metric(metric.clone());
        }
        Ok(())
    }

    fn export_state(&self) -> Option<serde_json::Value> {
        self.state.clone()
    }

    fn import_state(&mut self, state: serde_json::Value) {
        self.state = Some(state);
    }
}

/// In-memory container runtime with scripted exec replies.
#[derive(Default)]
pub struct FakeRuntime {
    pods: Mutex<HashMap<(String, String), Arc<Pod>>>,
    replies: Mutex<VecDeque<ExecOutput>>,
    calls: Mutex<Vec<(String, Vec<String>, Vec<u8>)>>,
}

impl FakeRuntime {
    /// Knows `default/web-0` (ip 10.0.0.1, label app=web, annotation owner=team-a).
    pub fn with_default_pod() -> Self {
        let runtime = FakeRuntime::default();
        runtime.add_pod(Pod {
            namespace: "default".into(),
            name: "web-0".into(),
            ip: "10.0.0.1".into(),
            hostname: "web-0".into(),
            labels: BTreeMap::from([("app".into(), "web".into())]),
            annotations: BTreeMap::from([("owner".into(), "team-a".into())]),
            main_container: Some("main-container".into()),
        });
        runtime
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods
            .lock()
            .insert((pod.namespace.clone(), pod.name.clone()), Arc::new(pod));
    }

    pub fn remove_pods(&self) {
        self.pods.lock().clear();
    }

    pub fn reply(&self, output: ExecOutput) {
        self.replies.lock().push_back(output);
    }

    pub fn exec_calls(&self) -> Vec<(String, Vec<String>, Vec<u8>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Option<Arc<Pod>>, CriError> {
        Ok(self.pods.lock().get(&(namespace.to_string(), pod.to_string())).cloned())
    }

    async fn exec(&self, container: &str, cmd: Vec<String>, stdin: Vec<u8>) -> Result<ExecOutput, CriError> {
        self.calls.lock().push((container.to_string(), cmd, stdin));
        Ok(self.replies.lock().pop_front().unwrap_or(ExecOutput {
            exit_code: 1,
            stdout: Vec::new(),
            stderr: b"no scripted reply".to_vec(),
        }))
    }
}

/// Builder for registry responses.
#[derive(Default)]
pub struct ResponseBuilder {
    response: SyncResponse,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bucket whose tasks are `(task_key, config, target)`.
    pub fn bucket(mut self, key: &str, state: &str, tasks: &[(&str, &CollectConfig, &CollectTarget)]) -> Self {
        let mut info = BucketInfo {
            state: state.into(),
            collect_tasks: Vec::new(),
        };
        for (task_key, config, target) in tasks {
            info.collect_tasks.push(TaskRef {
                key: task_key.to_string(),
                collect_config_key: config.key.clone(),
                collect_target_key: target.key.clone(),
            });
            self.response.collect_configs.insert(config.key.clone(), (*config).clone());
            self.response.collect_targets.insert(target.key.clone(), (*target).clone());
        }
        self.response.buckets.insert(key.into(), info);
        self
    }

    pub fn code(mut self, code: i32) -> Self {
        self.response.header.code = code;
        self
    }

    pub fn build(self) -> SyncResponse {
        self.response
    }
}

pub enum Reply {
    Ok(SyncResponse),
    Fail(String),
    Slow(Duration, SyncResponse),
}

/// Registry answering from a script; with nothing scripted it reports every
/// bucket the agent sent as unchanged.
#[derive(Default)]
pub struct FakeRegistry {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<SyncRequest>>,
}

impl FakeRegistry {
    pub fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn respond(&self, response: SyncResponse) {
        self.push(Reply::Ok(response));
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RegistrySync for FakeRegistry {
    async fn sync(&self, request: SyncRequest) -> anyhow::Result<SyncResponse> {
        self.requests.lock().push(request.clone());
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Ok(response)) => Ok(response),
            Some(Reply::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Reply::Slow(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            None => Ok(SyncResponse {
                header: ResponseHeader::ok(),
                buckets: request
                    .buckets
                    .into_iter()
                    .map(|(key, state)| {
                        (
                            key,
                            BucketInfo {
                                state,
                                collect_tasks: Vec::new(),
                            },
                        )
                    })
                    .collect(),
                ..Default::default()
            }),
        }
    }
}

/// Output that keeps every batch it receives.
#[derive(Default)]
pub struct CaptureOutput {
    batches: Mutex<Vec<(Vec<Metric>, Extension)>>,
}

impl CaptureOutput {
    pub fn batches(&self) -> Vec<(Vec<Metric>, Extension)> {
        self.batches.lock().clone()
    }

    /// Waits until at least `count` batches arrived; false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.batches.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.batches.lock().len() >= count
    }
}

#[async_trait]
impl Output for CaptureOutput {
    fn name(&self) -> &str {
        "capture"
    }

    async fn write(&self, metrics: &[Metric], extension: &Extension) -> Result<(), OutputError> {
        self.batches.lock().push((metrics.to_vec(), extension.clone()));
        Ok(())
    }
}

/// Listener that records every delta it is handed.
#[derive(Default)]
pub struct RecordingListener {
    deltas: Mutex<Vec<Delta>>,
}

impl RecordingListener {
    pub fn deltas(&self) -> Vec<Delta> {
        self.deltas.lock().clone()
    }

    /// Task keys added and deleted by delta `index`, each sorted.
    pub fn keys(&self, index: usize) -> (Vec<String>, Vec<String>) {
        let deltas = self.deltas.lock();
        let delta = &deltas[index];
        let mut add: Vec<String> = delta.add.iter().map(|t| t.key.clone()).collect();
        let mut del: Vec<String> = delta.del.iter().map(|t| t.key.clone()).collect();
        add.sort();
        del.sort();
        (add, del)
    }
}

impl ChangeListener for RecordingListener {
    fn on_change(&self, delta: &Delta) {
        self.deltas.lock().push(delta.clone());
    }
}

// Task manager - keeps the local task set in sync with the registry
//
// This module is responsible for:
// 1. Loading the cached buckets from the task store at start-up
// 2. Periodically sending `{bucket: state}` to the registry and applying the
//    buckets whose state changed
// 3. Turning every applied change into a `Delta` and handing it to listeners
// 4. Persisting applied buckets so a restart resumes from the last known set;
//    a bucket whose write failed is written again on the next round
//
// # Concurrency
// Buckets, listeners and the task count live behind one reader/writer lock.
// Applying a response and dispatching its delta happen under the write lock,
// so listeners observe deltas in the same total order as the state changes.
// Listeners must therefore return quickly and must not call back into the
// manager.

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{RegistrySync, SyncRequest};
use crate::store::{StoreError, TaskStore};
use crate::task::{Bucket, CollectTask, Delta};

/// Upper bound of one registry round trip.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Sync cadence until the registry says otherwise.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Errors of a single sync round. None of them changes the local state.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("registry sync timed out after {0:?}")]
    Timeout(Duration),

    #[error("registry sync failed: {0}")]
    Remote(#[source] anyhow::Error),

    #[error("registry rejected sync: code={code} message={message}")]
    Rejected { code: i32, message: String },

    #[error("sync round panicked: {0}")]
    Panic(String),
}

/// Receives every delta the manager applies.
///
/// Called while the manager holds its write lock: implementations must only
/// hand the delta off (enqueue, copy) and return.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, delta: &Delta);
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, Bucket>,
    listeners: Vec<Arc<dyn ChangeListener>>,
    tasks_count: usize,

    /// Buckets whose last store write failed; memory is ahead of the store
    dirty: HashSet<String>,
}

impl State {
    fn recount(&mut self) {
        self.tasks_count = self.buckets.values().map(|b| b.tasks.len()).sum();
    }

    fn all_tasks(&self) -> Vec<Arc<CollectTask>> {
        self.buckets.values().flat_map(|b| b.tasks.values().cloned()).collect()
    }

    /// Same bucket set with the same states, and nothing left to persist.
    fn is_settled_with(&self, incoming: &HashMap<String, Bucket>) -> bool {
        self.dirty.is_empty()
            && self.buckets.len() == incoming.len()
            && incoming
                .iter()
                .all(|(key, bucket)| self.buckets.get(key).is_some_and(|b| b.state == bucket.state))
    }
}

/// Keeps the local task set in sync with the registry.
///
/// The manager owns the bucket view, persists every applied change to the
/// [`TaskStore`] and hands each change to its listeners as a [`Delta`].
///
/// # Example
/// ```ignore
/// let manager = Arc::new(TaskManager::new("agent-1", store, registry)?);
/// manager.add_listener(pipelines.listener());
/// manager.sync_once().await?;
/// let handle = manager.start();
/// ```
pub struct TaskManager {
    agent_id: String,
    store: Arc<TaskStore>,
    registry: Arc<dyn RegistrySync>,
    state: RwLock<State>,

    /// Current sync interval in seconds
    interval_secs: AtomicU64,
    sync_timeout: Duration,

    /// Capacity 1: pending manual requests coalesce into one round
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,

    /// Serializes sync rounds between the loop and direct callers
    round: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl TaskManager {
    /// Creates the manager with the buckets cached in `store`.
    ///
    /// # Arguments
    /// * `agent_id` - Identity sent with every sync request
    /// * `store` - Local task cache, read once here and written on every change
    /// * `registry` - Client of the central registry
    ///
    /// # Errors
    /// Returns the store error when the cache cannot be read.
    pub fn new(agent_id: impl Into<String>, store: Arc<TaskStore>, registry: Arc<dyn RegistrySync>) -> Result<Self, StoreError> {
        let buckets = store.get_all()?;
        let mut state = State {
            buckets,
            ..Default::default()
        };
        state.recount();
        info!(
            "Loaded {} bucket(s) with {} task(s) from store",
            state.buckets.len(),
            state.tasks_count
        );

        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        Ok(TaskManager {
            agent_id: agent_id.into(),
            store,
            registry,
            state: RwLock::new(state),
            interval_secs: AtomicU64::new(DEFAULT_SYNC_INTERVAL.as_secs()),
            sync_timeout: SYNC_TIMEOUT,
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            round: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Registers `listener`, first handing it every current task as one delta.
    ///
    /// The bootstrap delta is delivered under the write lock, so no sync
    /// round can slip between it and the listener's registration.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        let mut state = self.state.write();
        let mut bootstrap = Delta::new(uuid::Uuid::new_v4().to_string());
        bootstrap.add = state.all_tasks();
        if !bootstrap.is_empty() {
            debug!(delta = %bootstrap.uuid, adds = bootstrap.add.len(), "bootstrap delta");
            dispatch(&listener, &bootstrap);
        }
        state.listeners.push(listener);
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::Relaxed))
    }

    pub fn tasks_count(&self) -> usize {
        self.state.read().tasks_count
    }

    pub fn get_all(&self) -> Vec<Arc<CollectTask>> {
        self.state.read().all_tasks()
    }

    /// The task with `key` in any bucket.
    pub fn check_task(&self, key: &str) -> Option<Arc<CollectTask>> {
        self.state.read().buckets.values().find_map(|b| b.tasks.get(key).cloned())
    }

    pub fn bucket_states(&self) -> HashMap<String, String> {
        self.state
            .read()
            .buckets
            .values()
            .map(|b| (b.key.clone(), b.state.clone()))
            .collect()
    }

    /// Runs one sync round and returns the applied delta (possibly empty).
    ///
    /// Sends the current `{bucket: state}` view, waits at most the sync
    /// timeout for the answer and applies the buckets whose state changed.
    /// An identical answer returns without taking the write lock.
    ///
    /// # Errors
    /// Timeouts, transport failures and non-OK headers. None of them changes
    /// the local state.
    pub async fn sync_once(&self) -> Result<Delta, SyncError> {
        let _round = self.round.lock().await;

        let request = SyncRequest {
            agent_id: self.agent_id.clone(),
            buckets: self.bucket_states(),
        };
        let response = match tokio::time::timeout(self.sync_timeout, self.registry.sync(request)).await {
            Err(_) => return Err(SyncError::Timeout(self.sync_timeout)),
            Ok(Err(e)) => return Err(SyncError::Remote(e)),
            Ok(Ok(response)) => response,
        };
        if !response.header.is_ok() {
            return Err(SyncError::Rejected {
                code: response.header.code,
                message: response.header.message,
            });
        }

        if let Some(interval) = response.control_configs.as_ref().and_then(|c| c.sync_interval()) {
            let previous = self.interval_secs.swap(interval.as_secs(), Ordering::Relaxed);
            if previous != interval.as_secs() {
                info!("Sync interval changed to {:?}", interval);
            }
        }

        let incoming = response.into_buckets();
        if self.state.read().is_settled_with(&incoming) {
            return Ok(Delta::new(uuid::Uuid::new_v4().to_string()));
        }
        Ok(self.apply(incoming))
    }

    /// Writes again the buckets whose last store write failed.
    fn persist_dirty(&self, state: &mut State) {
        let pending: Vec<String> = state.dirty.drain().collect();
        for key in pending {
            let written = match state.buckets.get(&key) {
                Some(bucket) => self.store.upsert_bucket(bucket),
                None => self.store.remove_bucket(&key),
            };
            match written {
                Ok(()) => info!(bucket = %key, "bucket persisted on retry"),
                Err(e) => {
                    warn!(bucket = %key, "bucket still not persisted: {}", e);
                    state.dirty.insert(key);
                }
            }
        }
    }

    /// Applies the registry's bucket view; buckets missing from it are removed.
    fn apply(&self, incoming: HashMap<String, Bucket>) -> Delta {
        let mut delta = Delta::new(uuid::Uuid::new_v4().to_string());
        let mut state = self.state.write();
        self.persist_dirty(&mut state);

        let removed: Vec<String> = state
            .buckets
            .keys()
            .filter(|key| !incoming.contains_key(*key))
            .cloned()
            .collect();
        for key in &removed {
            if let Some(bucket) = state.buckets.remove(key) {
                delta.del.extend(bucket.tasks.into_values());
            }
            match self.store.remove_bucket(key) {
                Ok(()) => {
                    state.dirty.remove(key);
                }
                Err(e) => {
                    warn!(bucket = %key, "failed to remove bucket from store, retrying next round: {}", e);
                    state.dirty.insert(key.clone());
                }
            }
            info!(bucket = %key, "bucket unassigned");
        }

        for (key, bucket) in incoming {
            let old = state.buckets.get(&key);
            if old.is_some_and(|old| old.state == bucket.state) {
                continue;
            }

            match old {
                Some(old) => {
                    for (task_key, task) in &old.tasks {
                        if !bucket.tasks.contains_key(task_key) {
                            delta.del.push(task.clone());
                        }
                    }
                    for (task_key, task) in &bucket.tasks {
                        match old.tasks.get(task_key) {
                            Some(previous) if !previous.is_different_with(task) => {}
                            _ => delta.add.push(task.clone()),
                        }
                    }
                }
                None => delta.add.extend(bucket.tasks.values().cloned()),
            }

            match self.store.upsert_bucket(&bucket) {
                Ok(()) => {
                    state.dirty.remove(&key);
                }
                Err(e) => {
                    warn!(bucket = %key, "failed to persist bucket, retrying next round: {}", e);
                    state.dirty.insert(key.clone());
                }
            }
            info!(bucket = %key, state = %bucket.state, tasks = bucket.tasks.len(), "bucket applied");
            state.buckets.insert(key, bucket);
        }

        // A task that moved between buckets is an update, not a removal.
        let added: HashSet<&str> = delta.add.iter().map(|t| t.key.as_str()).collect();
        let del: Vec<Arc<CollectTask>> = delta
            .del
            .iter()
            .filter(|t| !added.contains(t.key.as_str()))
            .cloned()
            .collect();
        delta.del = del;

        state.recount();
        if !delta.is_empty() {
            info!(
                delta = %delta.uuid,
                adds = delta.add.len(),
                dels = delta.del.len(),
                tasks = state.tasks_count,
                "applying task delta"
            );
            for listener in &state.listeners {
                dispatch(listener, &delta);
            }
        }
        delta
    }

    /// A sync round that never propagates failures or panics.
    async fn sync_round(&self) {
        let outcome = AssertUnwindSafe(self.sync_once())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(SyncError::Panic(panic_message(panic.as_ref()))));
        match outcome {
            Ok(delta) if delta.is_empty() => debug!("sync round: no changes"),
            Ok(_) => {}
            Err(e) => error!("sync round failed: {}", e),
        }
    }

    /// Requests a sync as soon as possible.
    ///
    /// Returns `false` when a request is already pending; both are served by
    /// the same round.
    pub fn trigger_sync(&self) -> bool {
        self.wake_tx.try_send(()).is_ok()
    }

    /// Spawns the sync loop. A second call returns `None`.
    ///
    /// # Behavior
    /// - Waits one sync interval, or less when `trigger_sync` is called
    /// - The interval is read again before every wait
    /// - Failed and panicking rounds are logged; the loop keeps going
    /// - Ends when `stop` is called
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut wake_rx = self.wake_rx.lock().take()?;
        let mut shutdown = self.shutdown.subscribe();
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!("Task manager sync loop started (interval {:?})", manager.sync_interval());
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.sync_interval()) => {}
                    Some(()) = wake_rx.recv() => debug!("manual sync requested"),
                    _ = shutdown.changed() => break,
                }
                manager.sync_round().await;
            }
            info!("Task manager sync loop stopped");
        }))
    }

    /// Asks the sync loop to exit after the round in flight.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

fn dispatch(listener: &Arc<dyn ChangeListener>, delta: &Delta) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_change(delta))) {
        error!(delta = %delta.uuid, "listener panicked: {}", panic_message(panic.as_ref()));
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ControlConfigs;
    use crate::testutil::{config, target, FakeRegistry, RecordingListener, Reply, ResponseBuilder};

    fn new_manager(store: Arc<TaskStore>, registry: Arc<FakeRegistry>) -> TaskManager {
        TaskManager::new("agent-1", store, registry).unwrap()
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fresh_start_adds_all_tasks() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let (c1, v1, v2) = (config("C1", "1", "httpcheck"), target("V1", "1", "pod"), target("V2", "1", "localhost"));
        registry.respond(
            ResponseBuilder::new()
                .bucket("A", "s1", &[("T1", &c1, &v1), ("T2", &c1, &v2)])
                .build(),
        );

        let manager = new_manager(store.clone(), registry.clone());
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());
        assert!(listener.deltas().is_empty());

        manager.sync_once().await.unwrap();

        assert_eq!(listener.keys(0), (keys(&["T1", "T2"]), vec![]));
        assert_eq!(manager.tasks_count(), 2);
        assert_eq!(store.task_count().unwrap(), 2);
        assert_eq!(store.bucket_state("A").unwrap().as_deref(), Some("s1"));
        assert!(registry.requests()[0].buckets.is_empty());
        assert_eq!(registry.requests()[0].agent_id, "agent-1");
    }

    #[tokio::test]
    async fn test_bucket_state_change_produces_diff() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let c1 = config("C1", "1", "httpcheck");
        let (c2, c2b) = (config("C2", "1", "dialcheck"), config("C2", "2", "dialcheck"));
        let v1 = target("V1", "1", "pod");
        registry.respond(
            ResponseBuilder::new()
                .bucket("A", "s1", &[("T1", &c1, &v1), ("T2", &c2, &v1), ("T4", &c1, &v1)])
                .build(),
        );
        registry.respond(
            ResponseBuilder::new()
                .bucket("A", "s2", &[("T2", &c2b, &v1), ("T3", &c1, &v1), ("T4", &c1, &v1)])
                .build(),
        );

        let manager = new_manager(store.clone(), registry.clone());
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());
        manager.sync_once().await.unwrap();
        manager.sync_once().await.unwrap();

        assert_eq!(listener.keys(1), (keys(&["T2", "T3"]), keys(&["T1"])));
        assert_eq!(manager.check_task("T2").unwrap().version, "2/1");
        assert!(manager.check_task("T1").is_none());
        assert_eq!(registry.requests()[1].buckets["A"], "s1");
        assert_eq!(store.task_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unassigned_bucket_removes_tasks() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let (c1, v1) = (config("C1", "1", "httpcheck"), target("V1", "1", "pod"));
        registry.respond(ResponseBuilder::new().bucket("A", "s1", &[("T1", &c1, &v1)]).build());
        registry.respond(ResponseBuilder::new().build());

        let manager = new_manager(store.clone(), registry);
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());
        manager.sync_once().await.unwrap();
        manager.sync_once().await.unwrap();

        assert_eq!(listener.keys(1), (vec![], keys(&["T1"])));
        assert_eq!(manager.tasks_count(), 0);
        assert_eq!(store.bucket_state("A").unwrap(), None);
        assert_eq!(store.task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timeout_and_failures_keep_state() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let (c1, v1) = (config("C1", "1", "httpcheck"), target("V1", "1", "pod"));
        registry.respond(ResponseBuilder::new().bucket("A", "s1", &[("T1", &c1, &v1)]).build());
        registry.push(Reply::Slow(
            Duration::from_millis(500),
            ResponseBuilder::new().build(),
        ));
        registry.push(Reply::Fail("connection refused".into()));
        registry.respond(ResponseBuilder::new().code(500).build());

        let manager = new_manager(store, registry).with_sync_timeout(Duration::from_millis(50));
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());
        manager.sync_once().await.unwrap();

        assert!(matches!(manager.sync_once().await, Err(SyncError::Timeout(_))));
        assert!(matches!(manager.sync_once().await, Err(SyncError::Remote(_))));
        assert!(matches!(
            manager.sync_once().await,
            Err(SyncError::Rejected { code: 500, .. })
        ));

        assert_eq!(listener.deltas().len(), 1);
        assert_eq!(manager.bucket_states()["A"], "s1");
        assert_eq!(manager.tasks_count(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_response_is_idempotent() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let (c1, v1) = (config("C1", "1", "httpcheck"), target("V1", "1", "pod"));
        registry.respond(ResponseBuilder::new().bucket("A", "s1", &[("T1", &c1, &v1)]).build());

        let manager = new_manager(store, registry);
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());
        manager.sync_once().await.unwrap();

        // nothing scripted: the fake echoes the agent's bucket states back
        let delta = manager.sync_once().await.unwrap();
        assert!(delta.is_empty());
        assert_eq!(listener.deltas().len(), 1);
        assert_eq!(manager.tasks_count(), 1);
    }

    #[test]
    fn test_settled_view_needs_same_states_and_clean_store() {
        let mut state = State::default();
        state.buckets.insert("A".into(), Bucket::new("A", "s1"));
        let same = HashMap::from([("A".to_string(), Bucket::new("A", "s1"))]);
        let changed = HashMap::from([("A".to_string(), Bucket::new("A", "s2"))]);
        let extra = HashMap::from([
            ("A".to_string(), Bucket::new("A", "s1")),
            ("B".to_string(), Bucket::new("B", "s1")),
        ]);

        assert!(state.is_settled_with(&same));
        assert!(!state.is_settled_with(&changed));
        assert!(!state.is_settled_with(&extra));
        assert!(!state.is_settled_with(&HashMap::new()));

        state.dirty.insert("A".into());
        assert!(!state.is_settled_with(&same));
    }

    #[tokio::test]
    async fn test_failed_persist_is_retried_next_round() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let store = Arc::new(TaskStore::open(&path).unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let (c1, c2, v1) = (config("C1", "1", "httpcheck"), config("C2", "1", "httpcheck"), target("V1", "1", "pod"));
        registry.respond(ResponseBuilder::new().bucket("A", "s1", &[("T1", &c1, &v1)]).build());
        registry.respond(
            ResponseBuilder::new()
                .bucket("A", "s2", &[("T1", &c1, &v1), ("T2", &c2, &v1)])
                .build(),
        );

        let manager = new_manager(store.clone(), registry);
        manager.sync_once().await.unwrap();

        // a second connection makes bucket updates fail
        let side = rusqlite::Connection::open(&path).unwrap();
        side.execute_batch(
            "CREATE TRIGGER reject_update BEFORE UPDATE ON buckets BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
        let delta = manager.sync_once().await.unwrap();
        assert_eq!(delta.add.len(), 1);
        assert_eq!(manager.bucket_states()["A"], "s2");
        assert_eq!(store.bucket_state("A").unwrap().as_deref(), Some("s1"));
        assert_eq!(store.task_count().unwrap(), 1);

        side.execute_batch("DROP TRIGGER reject_update;").unwrap();
        // nothing scripted: the registry echoes s2 back unchanged
        let delta = manager.sync_once().await.unwrap();
        assert!(delta.is_empty());
        assert_eq!(store.bucket_state("A").unwrap().as_deref(), Some("s2"));
        assert_eq!(store.task_count().unwrap(), 2);

        drop(manager);
        let reloaded = TaskStore::open(&path).unwrap().get_all().unwrap();
        assert_eq!(reloaded["A"].state, "s2");
        assert_eq!(reloaded["A"].tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_task_moving_between_buckets_is_not_deleted() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let (c1, v1) = (config("C1", "1", "httpcheck"), target("V1", "1", "pod"));
        registry.respond(ResponseBuilder::new().bucket("A", "s1", &[("T1", &c1, &v1)]).build());
        registry.respond(ResponseBuilder::new().bucket("B", "s1", &[("T1", &c1, &v1)]).build());

        let manager = new_manager(store.clone(), registry);
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());
        manager.sync_once().await.unwrap();
        manager.sync_once().await.unwrap();

        assert_eq!(listener.keys(1), (keys(&["T1"]), vec![]));
        assert_eq!(store.task_count().unwrap(), 1);
        assert_eq!(store.bucket_state("B").unwrap().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_restart_bootstraps_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let (c1, v1) = (config("C1", "1", "httpcheck"), target("V1", "1", "pod"));
        {
            let registry = Arc::new(FakeRegistry::default());
            registry.respond(
                ResponseBuilder::new()
                    .bucket("A", "s1", &[("T1", &c1, &v1), ("T2", &c1, &v1)])
                    .build(),
            );
            let manager = new_manager(Arc::new(TaskStore::open(&path).unwrap()), registry);
            manager.sync_once().await.unwrap();
        }

        let registry = Arc::new(FakeRegistry::default());
        let manager = new_manager(Arc::new(TaskStore::open(&path).unwrap()), registry.clone());
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());

        assert_eq!(listener.keys(0), (keys(&["T1", "T2"]), vec![]));
        manager.sync_once().await.unwrap();
        assert_eq!(registry.requests()[0].buckets["A"], "s1");
    }

    #[tokio::test]
    async fn test_control_configs_update_interval() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let mut response = ResponseBuilder::new().build();
        response.control_configs = Some(ControlConfigs {
            sync_configs_interval_seconds: 15,
        });
        registry.respond(response);
        let mut ignored = ResponseBuilder::new().build();
        ignored.control_configs = Some(ControlConfigs {
            sync_configs_interval_seconds: 0,
        });
        registry.respond(ignored);

        let manager = new_manager(store, registry);
        assert_eq!(manager.sync_interval(), DEFAULT_SYNC_INTERVAL);
        manager.sync_once().await.unwrap();
        assert_eq!(manager.sync_interval(), Duration::from_secs(15));
        manager.sync_once().await.unwrap();
        assert_eq!(manager.sync_interval(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_manual_triggers_coalesce() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let registry = Arc::new(FakeRegistry::default());
        let manager = Arc::new(new_manager(store, registry.clone()));

        assert!(manager.trigger_sync());
        assert!(!manager.trigger_sync());

        let handle = manager.start().unwrap();
        assert!(manager.start().is_none());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.requests().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.requests().len(), 1);

        manager.stop();
        handle.await.unwrap();
    }
}

// Pipeline registry - applies task deltas to the set of running pipelines
//
// The task manager calls listeners under its write lock, so the listener only
// enqueues the delta. A single worker owns the pipeline map and applies deltas
// in arrival order: deletions first, then additions (an addition of a known
// key replaces the running pipeline).

use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{Pipeline, PipelineContext};
use crate::manager::{panic_message, ChangeListener};
use crate::task::{CollectTask, Delta};

enum Command {
    Apply(Delta),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the pipeline worker.
///
/// # Example
/// ```ignore
/// let (pipelines, worker) = PipelineRegistry::spawn(ctx);
/// manager.add_listener(pipelines.listener());
/// // ...
/// pipelines.shutdown().await;
/// worker.await?;
/// ```
pub struct PipelineRegistry {
    tx: mpsc::UnboundedSender<Command>,

    /// Tasks of the running pipelines, for introspection
    running: Arc<RwLock<BTreeMap<String, Arc<CollectTask>>>>,
}

impl PipelineRegistry {
    /// Spawns the worker.
    pub fn spawn(ctx: Arc<PipelineContext>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(RwLock::new(BTreeMap::new()));
        let worker = Worker {
            ctx,
            pipelines: HashMap::new(),
            running: running.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));
        (PipelineRegistry { tx, running }, handle)
    }

    /// Listener to register with the task manager.
    pub fn listener(&self) -> Arc<RegistryListener> {
        Arc::new(RegistryListener { tx: self.tx.clone() })
    }

    pub fn keys(&self) -> Vec<String> {
        self.running.read().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CollectTask>> {
        self.running.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.running.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.read().is_empty()
    }

    /// Waits until every delta enqueued before this call has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Stops every pipeline and ends the worker.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// Forwards deltas to the worker without blocking the caller.
pub struct RegistryListener {
    tx: mpsc::UnboundedSender<Command>,
}

impl ChangeListener for RegistryListener {
    fn on_change(&self, delta: &Delta) {
        if self.tx.send(Command::Apply(delta.clone())).is_err() {
            warn!(delta = %delta.uuid, "pipeline worker is gone, delta dropped");
        }
    }
}

struct Worker {
    ctx: Arc<PipelineContext>,
    pipelines: HashMap<String, Pipeline>,
    running: Arc<RwLock<BTreeMap<String, Arc<CollectTask>>>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Apply(delta) => self.apply(delta).await,
                Command::Flush(done) => {
                    let _ = done.send(());
                }
                Command::Shutdown(done) => {
                    self.stop_all().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
        self.stop_all().await;
    }

    async fn apply(&mut self, delta: Delta) {
        info!(
            delta = %delta.uuid,
            adds = delta.add.len(),
            dels = delta.del.len(),
            "applying delta to pipelines"
        );
        for task in &delta.del {
            self.remove(&task.key).await;
        }
        for task in delta.add {
            self.upsert(task).await;
        }
        info!("{} pipeline(s) running", self.pipelines.len());
    }

    async fn remove(&mut self, key: &str) {
        if let Some(mut pipeline) = self.pipelines.remove(key) {
            pipeline.stop().await;
            self.running.write().remove(key);
        }
    }

    async fn upsert(&mut self, task: Arc<CollectTask>) {
        if let Some(current) = self.pipelines.get(&task.key) {
            if !current.task().is_different_with(&task) {
                return;
            }
        }

        let built = AssertUnwindSafe(Pipeline::build(task.clone(), self.ctx.clone()))
            .catch_unwind()
            .await;
        let mut pipeline = match built {
            Ok(Ok(pipeline)) => pipeline,
            Ok(Err(e)) => {
                error!(task = %task, "cannot create pipeline: {}", e);
                self.remove(&task.key).await;
                return;
            }
            Err(panic) => {
                error!(task = %task, "pipeline construction panicked: {}", panic_message(panic.as_ref()));
                self.remove(&task.key).await;
                return;
            }
        };

        if let Some(mut old) = self.pipelines.remove(&task.key) {
            pipeline.update_from(&old).await;
            old.stop().await;
        }
        pipeline.start();
        self.running.write().insert(task.key.clone(), task.clone());
        self.pipelines.insert(task.key.clone(), pipeline);
    }

    async fn stop_all(&mut self) {
        for (_, mut pipeline) in self.pipelines.drain() {
            pipeline.stop().await;
        }
        self.running.write().clear();
        info!("All pipelines stopped");
    }
}

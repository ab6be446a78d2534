// Pipeline module - one running collection loop per task
//
// A pipeline binds a task to an input, a fixed-rate trigger and an output. On
// every tick it runs one collection round:
//
// 1. collect into a fresh accumulator (in the agent, or inside the target
//    pod through the helper for pod-mode probes)
// 2. stamp the window start as timestamp and merge input, base and attach tags
//    (first non-empty value wins)
// 3. run the task's script, then prefix metric names
// 4. hand the batch to the output
//
// Rounds of one pipeline never overlap. Each is bounded by the interval and
// a failing or panicking round only loses its own batch.

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::btree_map::Entry;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::cri::ContainerRuntime;
use crate::crossns::{self, CrossNsError};
use crate::manager::panic_message;
use crate::model::{MemoryAccumulator, Tags};
use crate::now_ms;
use crate::output::{Output, OutputAdapter, OutputError};
use crate::plugin::{Input, NetworkMode, PluginError, PluginRegistry};
use crate::script::{self, Script, ScriptError, SCRIPT_BUDGET};
use crate::tags::{parse_ref_metas, TagError, TagResolver};
use crate::task::CollectTask;

pub mod registry;
pub mod trigger;

pub use registry::{PipelineRegistry, RegistryListener};
pub use trigger::FixedRate;

/// Interval used when a task has no usable execute rule.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Extra time `stop` grants a round in flight before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("invalid base config of task {task}: {source}")]
    Config {
        task: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid script: {0}")]
    Script(#[from] ScriptError),

    #[error("collect failed: {0}")]
    Collect(#[source] anyhow::Error),

    #[error(transparent)]
    CrossNs(#[from] CrossNsError),

    #[error(transparent)]
    Tags(#[from] TagError),

    #[error("output failed: {0}")]
    Output(#[from] OutputError),
}

impl PipelineError {
    /// The target is gone; the round is empty but the pipeline stays.
    pub fn is_no_pod(&self) -> bool {
        match self {
            PipelineError::CrossNs(e) => e.is_no_pod(),
            PipelineError::Tags(TagError::NoPod { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteRule {
    #[serde(rename = "type")]
    pub kind: String,

    /// Milliseconds
    pub fixed_rate: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Transform {
    pub metric_prefix: String,
    pub scripts: Vec<String>,
}

/// Pipeline settings shared by every plugin's config content.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BaseConf {
    pub execute_rule: Option<ExecuteRule>,
    pub ref_metas: Option<serde_json::Map<String, serde_json::Value>>,
    pub transform: Transform,
}

impl BaseConf {
    /// Reads the shared part of a config; an empty content means defaults.
    pub fn parse(content: &[u8]) -> Result<Self, serde_json::Error> {
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(BaseConf::default());
        }
        serde_json::from_slice(content)
    }

    pub fn interval(&self) -> Duration {
        match &self.execute_rule {
            Some(rule) if rule.kind == "fixedRate" && rule.fixed_rate > 0 => {
                Duration::from_millis(rule.fixed_rate as u64)
            }
            _ => DEFAULT_INTERVAL,
        }
    }
}

/// Dependencies shared by every pipeline.
pub struct PipelineContext {
    pub config: Arc<AgentConfig>,

    /// Factories of the inputs, looked up by normalized config type
    pub plugins: &'static PluginRegistry,

    /// `None` when no container runtime is reachable; pod targets then
    /// report `NoPod` every round
    pub runtime: Option<Arc<dyn ContainerRuntime>>,
    pub tags: Arc<TagResolver>,

    /// Sink every pipeline writes through its own `OutputAdapter`
    pub output: Arc<dyn Output>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct TimerState {
    /// Next fire time in ms; 0 until first armed
    next_fire_ms: i64,

    /// Fire time of the last round that began; windows up to it are taken
    last_fire_ms: i64,
}

/// Everything a round needs; shared with the spawned loop.
struct Runner {
    task: Arc<CollectTask>,
    trigger: FixedRate,
    input: tokio::sync::Mutex<Box<dyn Input>>,
    output: OutputAdapter,
    base_tags: Tags,
    prefix: String,
    script: Option<Arc<Script>>,
    timer: Arc<Mutex<TimerState>>,
    ctx: Arc<PipelineContext>,
}

/// One collection loop for one task.
///
/// A pipeline goes `Created -> Running -> Stopped` and is never restarted;
/// a changed task gets a new pipeline that takes over the old one's schedule
/// through `update_from`.
///
/// # Example
/// ```ignore
/// let mut pipeline = Pipeline::build(task, ctx).await?;
/// pipeline.start();
/// // ...
/// pipeline.stop().await;
/// ```
pub struct Pipeline {
    runner: Arc<Runner>,
    state: PipelineState,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Builds a pipeline for `task`: parses the shared config, creates the
    /// input and resolves base tags. Nothing runs until `start`.
    ///
    /// # Arguments
    /// * `task` - The task to collect; its config content carries the
    ///   execute rule, `refMetas` and transform next to the plugin settings
    /// * `ctx` - Dependencies shared by every pipeline
    ///
    /// # Errors
    /// Invalid config content or script, or a type no plugin is registered
    /// for.
    pub async fn build(task: Arc<CollectTask>, ctx: Arc<PipelineContext>) -> Result<Self, PipelineError> {
        let conf = BaseConf::parse(&task.config.content).map_err(|source| PipelineError::Config {
            task: task.key.clone(),
            source,
        })?;
        let ref_metas = parse_ref_metas(conf.ref_metas.as_ref()).map_err(|source| PipelineError::Config {
            task: task.key.clone(),
            source,
        })?;
        let script = if conf.transform.scripts.is_empty() {
            None
        } else {
            Some(Arc::new(Script::parse(&conf.transform.scripts)?))
        };

        let input = ctx.plugins.create(&task, &ctx.config)?;
        debug!(task = %task, input = %input.debug_info(), "input created");
        let prefix = if conf.transform.metric_prefix.is_empty() {
            input.default_prefix().to_string()
        } else {
            conf.transform.metric_prefix.clone()
        };
        let base_tags = ctx.tags.base_tags(&task, &ref_metas).await;
        let output = OutputAdapter::new(ctx.output.clone(), &task.target, &ctx.config);

        Ok(Pipeline {
            runner: Arc::new(Runner {
                trigger: FixedRate::new(conf.interval()),
                input: tokio::sync::Mutex::new(input),
                output,
                base_tags,
                prefix,
                script,
                timer: Arc::new(Mutex::new(TimerState::default())),
                ctx,
                task,
            }),
            state: PipelineState::Created,
            stop_tx: None,
            handle: None,
        })
    }

    pub fn key(&self) -> &str {
        &self.runner.task.key
    }

    pub fn task(&self) -> &Arc<CollectTask> {
        &self.runner.task
    }

    pub fn interval(&self) -> Duration {
        self.runner.trigger.interval()
    }

    pub fn prefix(&self) -> &str {
        &self.runner.prefix
    }

    pub fn base_tags(&self) -> &Tags {
        &self.runner.base_tags
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Next scheduled fire time in ms, 0 if never armed.
    pub fn next_fire_ms(&self) -> i64 {
        self.runner.timer.lock().next_fire_ms
    }

    /// Carries state over from the pipeline this one replaces.
    ///
    /// Opaque input state is always offered to the new input. The schedule is
    /// kept only when the interval did not change, and it resumes after the
    /// last window the old pipeline started, even if that round is still
    /// writing.
    ///
    /// # Arguments
    /// * `old` - The running or stopped pipeline of the same task key
    pub async fn update_from(&mut self, old: &Pipeline) {
        let state = old.runner.input.lock().await.export_state();
        if let Some(state) = state {
            self.runner.input.lock().await.import_state(state);
        }

        if old.runner.trigger == self.runner.trigger {
            let (next, last) = {
                let timer = old.runner.timer.lock();
                (timer.next_fire_ms, timer.last_fire_ms)
            };
            let next = if next != 0 && next <= last {
                self.runner.trigger.next(last, now_ms())
            } else {
                next
            };
            let mut timer = self.runner.timer.lock();
            timer.next_fire_ms = next;
            timer.last_fire_ms = last;
        }
    }

    /// Spawns the collection loop. Only a created pipeline can start.
    pub fn start(&mut self) {
        if self.state != PipelineState::Created {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.handle = Some(tokio::spawn(run(self.runner.clone(), stop_rx)));
        self.stop_tx = Some(stop_tx);
        self.state = PipelineState::Running;
        info!(task = %self.runner.task, interval = ?self.interval(), "pipeline started");
    }

    /// Stops the loop and waits for it to exit.
    ///
    /// A round in flight may finish first; it is aborted if it outlives
    /// `interval + 1s`.
    pub async fn stop(&mut self) {
        if self.state != PipelineState::Running {
            self.state = PipelineState::Stopped;
            return;
        }
        self.state = PipelineState::Stopped;
        if let Some(stop_tx) = self.stop_tx.take() {
            stop_tx.send_replace(true);
        }
        if let Some(mut handle) = self.handle.take() {
            let grace = self.interval() + STOP_GRACE;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(task = %self.runner.task.key, "pipeline did not stop within {:?}, aborting", grace);
                handle.abort();
            }
        }
        info!(task = %self.runner.task, "pipeline stopped");
    }

    /// Runs one round for the window starting at `metric_time`.
    ///
    /// # Returns
    /// The number of samples handed to the output; 0 when the input produced
    /// nothing, in which case the output is not called.
    pub async fn collect_once(&self, metric_time: i64) -> Result<usize, PipelineError> {
        self.runner.collect_once(metric_time).await
    }
}

async fn run(runner: Arc<Runner>, mut stop: watch::Receiver<bool>) {
    let interval_ms = runner.trigger.interval_ms();
    loop {
        let now = now_ms();
        let fire = {
            let mut timer = runner.timer.lock();
            if timer.next_fire_ms == 0 || timer.next_fire_ms + interval_ms <= now {
                timer.next_fire_ms = runner.trigger.first(now);
            }
            if timer.next_fire_ms <= timer.last_fire_ms {
                timer.next_fire_ms = runner.trigger.next(timer.last_fire_ms, now);
            }
            timer.next_fire_ms
        };

        let wait = Duration::from_millis((fire - now).max(0) as u64);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.changed() => break,
        }

        runner.timer.lock().last_fire_ms = fire;
        runner.round(fire - interval_ms).await;

        runner.timer.lock().next_fire_ms = runner.trigger.next(fire, now_ms());
        if *stop.borrow() {
            break;
        }
    }
    debug!(task = %runner.task.key, "pipeline loop exited");
}

impl Runner {
    /// One bounded, panic-isolated round.
    async fn round(&self, metric_time: i64) {
        let interval = self.trigger.interval();
        let outcome = AssertUnwindSafe(tokio::time::timeout(interval, self.collect_once(metric_time)))
            .catch_unwind()
            .await;
        match outcome {
            Err(panic) => error!(
                task = %self.task.key,
                round = metric_time,
                "collection round panicked: {}",
                panic_message(panic.as_ref())
            ),
            Ok(Err(_)) => warn!(task = %self.task.key, round = metric_time, "round exceeded {:?}", interval),
            Ok(Ok(Err(e))) if e.is_no_pod() => debug!(task = %self.task.key, round = metric_time, "{}", e),
            Ok(Ok(Err(e))) => warn!(task = %self.task.key, round = metric_time, "round failed: {}", e),
            Ok(Ok(Ok(count))) => debug!(task = %self.task.key, round = metric_time, samples = count, "round done"),
        }
    }

    async fn collect_once(&self, metric_time: i64) -> Result<usize, PipelineError> {
        let mut acc = MemoryAccumulator::new();
        let started = Instant::now();
        {
            let mut input = self.input.lock().await;
            let pod_mode = input
                .cross_namespace()
                .is_some_and(|c| c.network_mode() == NetworkMode::Pod);
            if pod_mode {
                if let Some(cross) = input.cross_namespace() {
                    crossns::collect(
                        self.ctx.runtime.as_deref(),
                        &self.ctx.config.helper_path,
                        &self.task.target,
                        cross,
                        &mut acc,
                    )
                    .await?;
                }
            } else {
                input.collect(&mut acc).await.map_err(PipelineError::Collect)?;
            }
        }
        let cost = started.elapsed();

        if acc.is_empty() {
            debug!(task = %self.task.key, "round produced no samples");
            return Ok(0);
        }

        let attach = self.ctx.tags.attach_tags(&self.task.target).await?;
        let mut metrics = acc.into_metrics();
        for metric in &mut metrics {
            metric.timestamp = metric_time;
            for (key, value) in self.base_tags.iter().chain(attach.iter()) {
                if value.is_empty() {
                    continue;
                }
                match metric.tags.entry(key.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(value.clone());
                    }
                    Entry::Occupied(mut slot) if slot.get().is_empty() => {
                        slot.insert(value.clone());
                    }
                    Entry::Occupied(_) => {}
                }
            }
        }

        if let Some(script) = &self.script {
            metrics = script::run(script.clone(), metrics, self.task.target.clone(), SCRIPT_BUDGET).await?;
        }

        if !self.prefix.is_empty() {
            for metric in &mut metrics {
                metric.name = format!("{}{}", self.prefix, metric.name);
            }
        }

        let count = metrics.len();
        if count > 0 {
            self.output.write(&metrics).await?;
        }
        debug!(
            task = %self.task.key,
            samples = count,
            cost_ms = cost.as_millis() as u64,
            "batch written to {}",
            self.output.name()
        );
        Ok(count)
    }
}

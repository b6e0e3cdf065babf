//! Actor dispatch
//!
//! The dispatcher owns the worker pool and, in multi-stage mode, the stage
//! pipeline. It routes the messages of completed firings to their targets by
//! [`ActorId`] and spawns every actor that became runnable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use super::config::{ExecutionMode, SchedulerConfig};
use super::pipeline::{Stage, StagePipeline, StageTask};
use crate::actor::{ActorId, InFlightGuard, KernelActor, OpContext, OutputCollector, Outgoing};
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::InferStage;
use crate::memory::MemoryManager;

/// Actors addressed by id, with a name index
#[derive(Debug)]
pub struct ActorDirectory {
    actors: Vec<Arc<KernelActor>>,
    by_name: HashMap<String, ActorId>,
}

impl ActorDirectory {
    /// `actors[i]` must carry `ActorId(i)`
    pub fn new(actors: Vec<Arc<KernelActor>>) -> RuntimeResult<Self> {
        let mut by_name = HashMap::with_capacity(actors.len());
        for (index, actor) in actors.iter().enumerate() {
            if actor.id() != ActorId(index) {
                return Err(RuntimeError::InternalError(format!(
                    "actor {} registered at position {}",
                    actor.id(),
                    index
                )));
            }
            by_name.insert(actor.name().to_string(), actor.id());
        }
        Ok(ActorDirectory { actors, by_name })
    }

    pub fn get(&self, id: ActorId) -> RuntimeResult<&Arc<KernelActor>> {
        self.actors
            .get(id.0)
            .ok_or_else(|| RuntimeError::ActorNotFound(id.to_string()))
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<KernelActor>> {
        self.by_name.get(name).and_then(|id| self.actors.get(id.0))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<KernelActor>> {
        self.actors.iter()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

/// State of the run in progress
#[derive(Debug)]
pub struct RunHandle {
    pub ctx: Arc<OpContext>,
    pub collector: OutputCollector,
    /// Receive actors still waiting for their remote message
    awaiting_remote: AtomicUsize,
}

impl RunHandle {
    pub fn new(ctx: Arc<OpContext>, outputs: usize, awaiting_remote: usize) -> Self {
        RunHandle {
            ctx,
            collector: OutputCollector::new(outputs),
            awaiting_remote: AtomicUsize::new(awaiting_remote),
        }
    }

    pub fn remote_arrived(&self) {
        let _ = self
            .awaiting_remote
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.ctx.notify();
    }

    pub fn awaiting_remote(&self) -> usize {
        self.awaiting_remote.load(Ordering::Acquire)
    }
}

pub struct Dispatcher {
    directory: Arc<ActorDirectory>,
    pool: rayon::ThreadPool,
    pipeline: Option<StagePipeline>,
    manager: Arc<MemoryManager>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<ActorDirectory>,
        config: &SchedulerConfig,
        manager: Arc<MemoryManager>,
    ) -> RuntimeResult<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("kforge-worker-{}", i))
            .build()
            .map_err(|e| RuntimeError::InternalError(format!("worker pool: {}", e)))?;
        let pipeline = match config.execution_mode {
            ExecutionMode::SinglePipeline => None,
            ExecutionMode::MultiStage => Some(StagePipeline::new()?),
        };
        debug!(
            workers = config.worker_threads,
            mode = ?config.execution_mode,
            actors = directory.len(),
            "dispatcher ready"
        );
        Ok(Arc::new(Dispatcher {
            directory,
            pool,
            pipeline,
            manager,
        }))
    }

    pub fn directory(&self) -> &Arc<ActorDirectory> {
        &self.directory
    }

    pub fn pipeline(&self) -> Option<&StagePipeline> {
        self.pipeline.as_ref()
    }

    /// Fire `actor` for `run` on the worker pool
    pub fn spawn(self: &Arc<Self>, run: &Arc<RunHandle>, actor: ActorId) {
        let guard = run.ctx.begin_task();
        let dispatcher = self.clone();
        let run = run.clone();
        trace!(%actor, sequence = run.ctx.sequence(), "actor spawned");
        self.pool.spawn(move || dispatcher.fire(run, actor, guard));
    }

    fn fire(self: Arc<Self>, run: Arc<RunHandle>, id: ActorId, guard: InFlightGuard) {
        let actor = match self.directory.get(id) {
            Ok(actor) => actor.clone(),
            Err(e) => {
                run.ctx.set_failed(e);
                return;
            }
        };
        if let Err(e) = actor.device().bind_device_to_current_thread() {
            actor.fail(&run.ctx, e.into());
            return;
        }

        if self.pipeline.is_some() {
            self.fire_staged(run, actor, guard);
            return;
        }
        let outgoing = actor.run(&run.ctx);
        self.deliver(&run, outgoing);
        drop(actor);
        drop(run);
        drop(guard);
    }

    /// Fetch inputs on the worker, then hand the firing to the stage
    /// executors
    fn fire_staged(self: Arc<Self>, run: Arc<RunHandle>, actor: Arc<KernelActor>, guard: InFlightGuard) {
        let begun = match &self.pipeline {
            Some(pipeline) => {
                let drain = || pipeline.wait_drained();
                actor.begin(&run.ctx, Some(&drain))
            }
            None => actor.begin(&run.ctx, None),
        };
        match begun {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                actor.fail(&run.ctx, e);
                return;
            }
        }

        let plan = actor.stage_plan();
        let first = if plan.infer != InferStage::None {
            Stage::Infer
        } else if plan.resize {
            Stage::Resize
        } else {
            Stage::Launch
        };
        self.submit_stage(first, run, actor, guard);
    }

    fn submit_stage(
        self: Arc<Self>,
        stage: Stage,
        run: Arc<RunHandle>,
        actor: Arc<KernelActor>,
        guard: InFlightGuard,
    ) {
        let ctx = run.ctx.clone();
        let Some(pipeline) = &self.pipeline else {
            ctx.set_failed(RuntimeError::InternalError(format!(
                "{} stage submitted without a pipeline",
                stage
            )));
            return;
        };
        let dispatcher = self.clone();
        let task: StageTask = Box::new(move || dispatcher.run_stage(stage, run, actor, guard));
        if let Err(task) = pipeline.submit(stage, task) {
            ctx.set_failed(RuntimeError::ChannelClosed(format!("{} stage executor", stage)));
            drop(task);
        }
    }

    fn run_stage(
        self: Arc<Self>,
        stage: Stage,
        run: Arc<RunHandle>,
        actor: Arc<KernelActor>,
        guard: InFlightGuard,
    ) {
        if let Err(e) = actor.device().bind_device_to_current_thread() {
            actor.fail(&run.ctx, e.into());
            return;
        }
        let next = match stage {
            Stage::Infer => actor.infer(&run.ctx).map(|ok| ok.then_some(Stage::Resize)),
            Stage::Resize => actor.resize(&run.ctx).map(|ok| ok.then_some(Stage::Launch)),
            Stage::Launch => actor.launch(&run.ctx).map(|outgoing| {
                if let Some(outgoing) = outgoing {
                    self.deliver(&run, outgoing);
                }
                None
            }),
        };
        match next {
            Ok(Some(next)) => self.submit_stage(next, run, actor, guard),
            Ok(None) => {
                drop(actor);
                drop(run);
                drop(guard);
            }
            Err(e) => actor.fail(&run.ctx, e),
        }
    }

    /// Route the messages of a completed firing
    ///
    /// Data messages precede control messages; a target that became
    /// runnable is spawned right away.
    pub fn deliver(self: &Arc<Self>, run: &Arc<RunHandle>, outgoing: Vec<Outgoing>) {
        for message in outgoing {
            let result = match message {
                Outgoing::Data { to, data } => self
                    .directory
                    .get(to)
                    .and_then(|actor| actor.receive_data(&run.ctx, data))
                    .map(|runnable| runnable.then_some(to)),
                Outgoing::Control { to, control } => self
                    .directory
                    .get(to)
                    .and_then(|actor| actor.receive_control(&run.ctx, control))
                    .map(|runnable| runnable.then_some(to)),
                Outgoing::Output {
                    position,
                    tensor,
                    from,
                } => {
                    trace!(%from, position, "graph output delivered");
                    let collected = run.collector.collect(position, &tensor, &self.manager);
                    run.ctx.notify();
                    collected.map(|_| None)
                }
            };
            match result {
                Ok(Some(to)) => self.spawn(run, to),
                Ok(None) => {}
                Err(e) => run.ctx.set_failed(e),
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actors", &self.directory.len())
            .field("workers", &self.pool.current_num_threads())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

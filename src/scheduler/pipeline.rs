//! Multi-stage execution pipeline
//!
//! Infer, resize and launch each run on their own single-thread executor. A
//! firing is a chain of continuation tasks: each stage submits the next one
//! before it finishes, so the pipeline never looks idle in the middle of a
//! chain. [`StagePipeline::wait_drained`] blocks until every executor is idle.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{RuntimeError, RuntimeResult};

pub type StageTask = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Infer,
    Resize,
    Launch,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Infer, Stage::Resize, Stage::Launch];

    fn index(self) -> usize {
        match self {
            Stage::Infer => 0,
            Stage::Resize => 1,
            Stage::Launch => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Infer => "infer",
            Stage::Resize => "resize",
            Stage::Launch => "launch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tasks submitted to any stage and not finished yet
#[derive(Debug, Default)]
struct PendingTasks {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingTasks {
    fn count(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn increase(&self) {
        *self.count() += 1;
    }

    fn decrease(&self) {
        let mut count = self.count();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count();
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Decrements the pending count even if a task panics
struct TaskDone<'a>(&'a PendingTasks);

impl Drop for TaskDone<'_> {
    fn drop(&mut self) {
        self.0.decrease();
    }
}

/// Dedicated thread running the tasks of one stage in submission order
pub struct StageExecutor {
    stage: Stage,
    sender: Option<mpsc::UnboundedSender<StageTask>>,
    handle: Option<JoinHandle<()>>,
}

impl StageExecutor {
    fn spawn(stage: Stage, pending: Arc<PendingTasks>) -> RuntimeResult<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<StageTask>();
        let handle = std::thread::Builder::new()
            .name(format!("kforge-{}", stage))
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    let _done = TaskDone(&pending);
                    trace!(%stage, "stage task");
                    task();
                }
                debug!(%stage, "stage executor stopped");
            })
            .map_err(|e| RuntimeError::InternalError(format!("spawn {} executor: {}", stage, e)))?;

        Ok(StageExecutor {
            stage,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn submit(&self, task: StageTask) -> Result<(), StageTask> {
        match &self.sender {
            Some(sender) => sender.send(task).map_err(|e| e.0),
            None => Err(task),
        }
    }
}

impl Drop for StageExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecutor")
            .field("stage", &self.stage)
            .field("running", &self.sender.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct StagePipeline {
    executors: Vec<StageExecutor>,
    pending: Arc<PendingTasks>,
}

impl StagePipeline {
    pub fn new() -> RuntimeResult<Self> {
        let pending = Arc::new(PendingTasks::default());
        let executors = Stage::ALL
            .iter()
            .map(|stage| StageExecutor::spawn(*stage, pending.clone()))
            .collect::<RuntimeResult<Vec<_>>>()?;
        Ok(StagePipeline { executors, pending })
    }

    /// Queue `task` on `stage`; hands the task back if the executor is gone
    pub fn submit(&self, stage: Stage, task: StageTask) -> Result<(), StageTask> {
        self.pending.increase();
        let result = self.executors[stage.index()].submit(task);
        if result.is_err() {
            self.pending.decrease();
        }
        result
    }

    /// Tasks queued or running across all stages
    pub fn pending(&self) -> usize {
        *self.pending.count()
    }

    /// Block until every stage executor is idle
    ///
    /// Must not be called from a stage task.
    pub fn wait_drained(&self) {
        self.pending.wait_zero();
    }
}

//! Graph scheduling
//!
//! [`GraphScheduler`] builds one kernel actor per graph node and executes the
//! graph by message passing between them. Actors run on a worker pool; in
//! multi-stage mode the infer, resize and launch stages of each firing move
//! through dedicated stage executors.

pub mod config;
pub mod dispatcher;
pub mod graph_scheduler;
pub mod pipeline;
pub mod telemetry;

pub use config::{ExecutionMode, MemoryRequestMode, SchedulerConfig};
pub use dispatcher::{ActorDirectory, Dispatcher, RunHandle};
pub use graph_scheduler::GraphScheduler;
pub use pipeline::{Stage, StagePipeline, StageTask};
pub use telemetry::{ActorStats, ExecutionSummary, Telemetry};

//! kernelforge - actor-based kernel graph execution
//!
//! A compiled kernel graph is executed by one kernel actor per node. Actors
//! exchange device tensors through data and control messages, allocate and
//! free device memory per firing, launch their kernel on a device stream and
//! hand results to their successors.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kernelforge::context::RuntimeContext;
//! use kernelforge::device::{DeviceContext, HostDevice};
//! use kernelforge::graph::KernelGraph;
//! use kernelforge::scheduler::{GraphScheduler, SchedulerConfig};
//!
//! # fn graph() -> KernelGraph { KernelGraph::new() }
//! let runtime = RuntimeContext::new(SchedulerConfig::from_env()?)?;
//! let device: Arc<dyn DeviceContext> = Arc::new(HostDevice::new(0));
//! let scheduler = GraphScheduler::build(graph(), vec![device], runtime)?;
//! let outputs = scheduler.run(&[])?;
//! # Ok::<(), kernelforge::RuntimeError>(())
//! ```

#![allow(clippy::type_complexity)] // Graph part tuples are clearer inline

pub mod actor;
pub mod context;
pub mod device;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod scheduler;

pub use actor::{ActorId, ActorPhase, ActorVariant, KernelActor, OpContext};
pub use context::RuntimeContext;
pub use device::{DeviceContext, DeviceError, HostDevice, StreamId};
pub use error::{ErrorCategory, RuntimeError, RuntimeResult};
pub use graph::{GraphNode, InputSource, KernelGraph};
pub use kernel::{HostTensor, KernelMod, ShapeKind, TensorInfo};
pub use memory::{DeviceTensor, MemoryManager};
pub use scheduler::{ExecutionMode, GraphScheduler, SchedulerConfig};

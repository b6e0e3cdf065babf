//! Configuration for the graph scheduler
//!
//! [`SchedulerConfig`] picks the execution mode, worker pool size, how actors
//! reach the memory manager and whether multi-stream synchronization is on.
//! Values come from `Default`, the `with_*` builder, or `KFORGE_*` variables.

use std::time::Duration;

use crate::error::{RuntimeError, RuntimeResult};

const EXECUTION_MODE_ENV: &str = "KFORGE_EXECUTION_MODE";
const WORKER_THREADS_ENV: &str = "KFORGE_WORKER_THREADS";
const MEMORY_MODE_ENV: &str = "KFORGE_MEMORY_MODE";
const RUN_TIMEOUT_ENV: &str = "KFORGE_RUN_TIMEOUT_MS";
const ENABLE_SOMAS_ENV: &str = "KFORGE_ENABLE_SOMAS";

/// How an actor's pre-launch stages are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Infer, resize, alloc, launch and free run in one worker turn
    #[default]
    SinglePipeline,
    /// Infer, resize and launch run on dedicated stage executors
    MultiStage,
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "single" | "single_pipeline" | "sync" => Some(ExecutionMode::SinglePipeline),
            "multi" | "multi_stage" | "pipeline" => Some(ExecutionMode::MultiStage),
            _ => None,
        }
    }
}

/// How actors issue memory requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryRequestMode {
    /// Call the memory manager on the actor's thread
    #[default]
    Synchronous,
    /// Post requests to the memory service thread and wait for replies
    Message,
}

impl MemoryRequestMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sync" | "synchronous" | "direct" => Some(MemoryRequestMode::Synchronous),
            "message" | "async" | "service" => Some(MemoryRequestMode::Message),
            _ => None,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub execution_mode: ExecutionMode,

    /// Threads in the actor worker pool
    pub worker_threads: usize,

    pub memory_mode: MemoryRequestMode,

    /// Cross-stream deferred free; `None` enables it when the graph uses
    /// more than one stream
    pub multi_stream: Option<bool>,

    /// Fail a run that has not completed after this long
    pub run_timeout: Option<Duration>,

    /// Honor static memory plan placements
    pub enable_somas: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            execution_mode: ExecutionMode::SinglePipeline,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get().min(8))
                .unwrap_or(4),
            memory_mode: MemoryRequestMode::Synchronous,
            multi_stream: None,
            run_timeout: None,
            enable_somas: true,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_memory_mode(mut self, mode: MemoryRequestMode) -> Self {
        self.memory_mode = mode;
        self
    }

    pub fn with_multi_stream(mut self, enabled: bool) -> Self {
        self.multi_stream = Some(enabled);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_somas(mut self, enabled: bool) -> Self {
        self.enable_somas = enabled;
        self
    }

    /// Defaults overridden by `KFORGE_*` environment variables
    pub fn from_env() -> RuntimeResult<Self> {
        let mut config = SchedulerConfig::default();

        if let Ok(mode) = std::env::var(EXECUTION_MODE_ENV) {
            config.execution_mode = ExecutionMode::parse(&mode)
                .ok_or_else(|| invalid_env(EXECUTION_MODE_ENV, &mode))?;
        }
        if let Ok(threads) = std::env::var(WORKER_THREADS_ENV) {
            config.worker_threads = threads
                .trim()
                .parse()
                .map_err(|_| invalid_env(WORKER_THREADS_ENV, &threads))?;
        }
        if let Ok(mode) = std::env::var(MEMORY_MODE_ENV) {
            config.memory_mode = MemoryRequestMode::parse(&mode)
                .ok_or_else(|| invalid_env(MEMORY_MODE_ENV, &mode))?;
        }
        if let Ok(ms) = std::env::var(RUN_TIMEOUT_ENV) {
            let ms: u64 = ms.trim().parse().map_err(|_| invalid_env(RUN_TIMEOUT_ENV, &ms))?;
            config.run_timeout = Some(Duration::from_millis(ms));
        }
        if let Ok(flag) = std::env::var(ENABLE_SOMAS_ENV) {
            config.enable_somas = match flag.trim().to_lowercase().as_str() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => return Err(invalid_env(ENABLE_SOMAS_ENV, &flag)),
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.worker_threads == 0 {
            return Err(crate::config_error!("worker_threads must be > 0"));
        }
        if self.run_timeout == Some(Duration::ZERO) {
            return Err(crate::config_error!("run_timeout must be > 0"));
        }
        Ok(())
    }
}

fn invalid_env(var: &str, value: &str) -> RuntimeError {
    RuntimeError::InvalidConfiguration(format!("{}={:?} is not valid", var, value))
}

//! Runtime context
//!
//! Everything actors share that is not part of the graph: the scheduler
//! configuration, the memory manager (and how to reach it), the persistent
//! device tensor store and the input copy store. One `RuntimeContext` is created per scheduler and
//! handed to every actor, so several schedulers can coexist in one process.
//!
//! ```rust,no_run
//! use kernelforge::context::RuntimeContext;
//! use kernelforge::scheduler::{MemoryRequestMode, SchedulerConfig};
//!
//! let config = SchedulerConfig::new().with_memory_mode(MemoryRequestMode::Message);
//! let runtime = RuntimeContext::new(config)?;
//! assert!(runtime.tensor_store().is_empty()?);
//! # Ok::<(), kernelforge::RuntimeError>(())
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::error::RuntimeResult;
use crate::memory::{DeviceTensorCopyStore, DeviceTensorStore, MemoryClient, MemoryManager, MemoryService};
use crate::scheduler::{MemoryRequestMode, SchedulerConfig};

#[derive(Debug)]
pub struct RuntimeContext {
    config: SchedulerConfig,
    memory: MemoryClient,
    store: DeviceTensorStore,
    copies: DeviceTensorCopyStore,
}

impl RuntimeContext {
    pub fn new(config: SchedulerConfig) -> RuntimeResult<Arc<Self>> {
        config.validate()?;
        let manager = Arc::new(MemoryManager::new());
        let memory = match config.memory_mode {
            MemoryRequestMode::Synchronous => MemoryClient::Direct(manager),
            MemoryRequestMode::Message => MemoryClient::Message {
                service: MemoryService::spawn(manager.clone())?,
                manager,
            },
        };
        debug!(mode = ?config.memory_mode, "runtime context created");
        Ok(Arc::new(RuntimeContext {
            config,
            memory,
            store: DeviceTensorStore::new(),
            copies: DeviceTensorCopyStore::new(),
        }))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryClient {
        &self.memory
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        self.memory.manager()
    }

    pub fn tensor_store(&self) -> &DeviceTensorStore {
        &self.store
    }

    pub fn copy_store(&self) -> &DeviceTensorCopyStore {
        &self.copies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_client_follows_config() {
        let direct = RuntimeContext::new(SchedulerConfig::default()).unwrap();
        assert!(matches!(direct.memory(), MemoryClient::Direct(_)));

        let message = RuntimeContext::new(
            SchedulerConfig::new().with_memory_mode(MemoryRequestMode::Message),
        )
        .unwrap();
        assert!(matches!(message.memory(), MemoryClient::Message { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = RuntimeContext::new(SchedulerConfig::new().with_worker_threads(0)).unwrap_err();
        assert!(err.is_configuration_error());
    }
}

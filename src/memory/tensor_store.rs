//! Persistent device tensor store
//!
//! Holds operands that are bound once and reused by every run (weights).
//! During a run the store is only read; binding happens between runs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::DeviceTensor;
use crate::device::DeviceType;
use crate::error::RuntimeResult;

#[derive(Debug, Default)]
pub struct DeviceTensorStore {
    tensors: RwLock<HashMap<(String, DeviceType), Arc<DeviceTensor>>>,
}

impl DeviceTensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tensor` under `key` for its device type, replacing any
    /// previous entry; returns the replaced tensor
    pub fn insert(
        &self,
        key: &str,
        tensor: Arc<DeviceTensor>,
    ) -> RuntimeResult<Option<Arc<DeviceTensor>>> {
        let device_type = tensor.device_type();
        debug!(key, %device_type, "binding persistent tensor");
        Ok(self
            .tensors
            .write()?
            .insert((key.to_string(), device_type), tensor))
    }

    pub fn fetch(&self, key: &str, device_type: DeviceType) -> RuntimeResult<Option<Arc<DeviceTensor>>> {
        Ok(self
            .tensors
            .read()?
            .get(&(key.to_string(), device_type))
            .cloned())
    }

    /// Any device copy of `key`
    pub fn fetch_any(&self, key: &str) -> RuntimeResult<Option<Arc<DeviceTensor>>> {
        Ok(self
            .tensors
            .read()?
            .iter()
            .find(|((k, _), _)| k == key)
            .map(|(_, t)| t.clone()))
    }

    pub fn len(&self) -> RuntimeResult<usize> {
        Ok(self.tensors.read()?.len())
    }

    pub fn is_empty(&self) -> RuntimeResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry, returning the tensors so the caller can release
    /// their memory
    pub fn drain(&self) -> RuntimeResult<Vec<Arc<DeviceTensor>>> {
        Ok(self.tensors.write()?.drain().map(|(_, t)| t).collect())
    }
}

//! Device tensor copy store
//!
//! Links an input scratch copy to the tensor it was copied from. An in-place
//! kernel that writes through its copy must have the result carried back to
//! the source, otherwise the next reader of the source sees stale data.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tracing::trace;

use super::DeviceTensor;
use crate::error::RuntimeResult;

#[derive(Debug, Default)]
pub struct DeviceTensorCopyStore {
    /// copy id -> source
    sources: RwLock<HashMap<u64, Weak<DeviceTensor>>>,
}

impl DeviceTensorCopyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `copy` currently mirrors `source`
    pub fn insert(&self, copy: &DeviceTensor, source: &Arc<DeviceTensor>) -> RuntimeResult<()> {
        trace!(copy = copy.name(), source = source.name(), "copy linked");
        self.sources
            .write()?
            .insert(copy.id(), Arc::downgrade(source));
        Ok(())
    }

    /// Source of `copy`, if it is still alive
    pub fn fetch(&self, copy: &DeviceTensor) -> RuntimeResult<Option<Arc<DeviceTensor>>> {
        Ok(self
            .sources
            .read()?
            .get(&copy.id())
            .and_then(Weak::upgrade))
    }

    pub fn remove(&self, copy: &DeviceTensor) -> RuntimeResult<()> {
        self.sources.write()?.remove(&copy.id());
        Ok(())
    }

    pub fn len(&self) -> RuntimeResult<usize> {
        Ok(self.sources.read()?.len())
    }

    pub fn is_empty(&self) -> RuntimeResult<bool> {
        Ok(self.len()? == 0)
    }
}

//! Graph output collection

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::HostTensor;
use crate::memory::{DeviceTensor, MemoryManager};

/// Receives the graph-output data messages of one run
///
/// Each output is downloaded to the host once its producer's stream is
/// synchronized, then the collector's reference on the device tensor is
/// released.
#[derive(Debug)]
pub struct OutputCollector {
    slots: Mutex<Vec<Option<HostTensor>>>,
}

impl OutputCollector {
    pub fn new(outputs: usize) -> Self {
        OutputCollector {
            slots: Mutex::new(vec![None; outputs]),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<HostTensor>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn collect(
        &self,
        position: usize,
        tensor: &DeviceTensor,
        manager: &MemoryManager,
    ) -> RuntimeResult<()> {
        let expected = self.slots().len();
        if position >= expected {
            return Err(RuntimeError::IndexOutOfRange {
                node: tensor.name().to_string(),
                what: "graph output",
                index: position,
                len: expected,
            });
        }

        let device = tensor.device();
        device.sync_stream(tensor.stream_id())?;
        let ptr = tensor.ptr();
        let data = if tensor.size() == 0 {
            Vec::new()
        } else if ptr.is_null() {
            return Err(RuntimeError::InternalError(format!(
                "graph output {} ({}) has no device memory",
                position,
                tensor.name()
            )));
        } else {
            device.read_to_host(ptr, tensor.size())?
        };
        trace!(position, tensor = tensor.name(), bytes = data.len(), "graph output collected");
        manager.release(tensor);

        let mut slots = self.slots();
        if slots[position].is_some() {
            return Err(RuntimeError::InternalError(format!(
                "graph output {} delivered twice",
                position
            )));
        }
        slots[position] = Some(HostTensor::new(tensor.info(), data));
        Ok(())
    }

    pub fn received(&self) -> usize {
        self.slots().iter().filter(|s| s.is_some()).count()
    }

    pub fn expected(&self) -> usize {
        self.slots().len()
    }

    pub fn is_complete(&self) -> bool {
        self.slots().iter().all(Option::is_some)
    }

    /// Take the outputs in graph order; fails if any is missing
    pub fn take_outputs(&self) -> RuntimeResult<Vec<HostTensor>> {
        let mut slots = self.slots();
        if let Some(missing) = slots.iter().position(Option::is_none) {
            return Err(RuntimeError::InternalError(format!(
                "graph output {} was never produced",
                missing
            )));
        }
        Ok(std::mem::take(&mut *slots).into_iter().flatten().collect())
    }
}

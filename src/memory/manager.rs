//! Memory manager
//!
//! Allocation for one request is all-or-nothing: if any tensor in the list
//! cannot be allocated, everything allocated by that request is released and
//! the run's op context is marked failed. Release is reference counted; a
//! tensor's memory goes back to the device when its count reaches zero and
//! the count is then restored for the next run.
//!
//! Requests are served either directly on the caller's thread
//! ([`MemoryClient::Direct`]) or by a dedicated service thread that receives
//! requests over a channel and replies through a oneshot
//! ([`MemoryClient::Message`]).

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use super::DeviceTensor;
use crate::actor::OpContext;
use crate::device::DeviceContext;
use crate::error::{RuntimeError, RuntimeResult};

/// Memory manager counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub alloc_requests: usize,
    pub allocated_tensors: usize,
    /// Tensors in an allocation request that already held memory
    pub already_allocated: usize,
    pub failed_requests: usize,
    pub free_requests: usize,
    pub released_tensors: usize,
    pub adopted_ref_outputs: usize,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryStats {{ alloc requests: {} ({} failed), allocated: {}, already allocated: {}, free requests: {}, released: {}, adopted: {} }}",
            self.alloc_requests,
            self.failed_requests,
            self.allocated_tensors,
            self.already_allocated,
            self.free_requests,
            self.released_tensors,
            self.adopted_ref_outputs
        )
    }
}

/// Process-wide allocation coordinator
#[derive(Debug, Default)]
pub struct MemoryManager {
    /// Serializes allocation requests across actors
    alloc_lock: Mutex<()>,
    stats: Mutex<MemoryStats>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn stats_mut(&self) -> MutexGuard<'_, MemoryStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats_mut().clone()
    }

    /// Allocate every tensor in `list` that does not hold memory yet
    pub fn allocate(
        &self,
        list: &[Arc<DeviceTensor>],
        device: &dyn DeviceContext,
        requester: &str,
    ) -> RuntimeResult<()> {
        let _serial = self.alloc_lock.lock()?;
        self.stats_mut().alloc_requests += 1;

        let mut allocated: Vec<&Arc<DeviceTensor>> = Vec::with_capacity(list.len());
        for tensor in list {
            if !tensor.ptr().is_null() {
                self.stats_mut().already_allocated += 1;
                continue;
            }

            match device.allocate(tensor.size()) {
                Ok(ptr) => {
                    trace!(requester, tensor = tensor.name(), %ptr, size = tensor.size(), "allocated");
                    tensor.set_ptr(ptr);
                    allocated.push(tensor);
                }
                Err(e) => {
                    for done in allocated {
                        let (ptr, owned) = done.clear_ptr();
                        if owned {
                            if let Err(free_err) = device.free(ptr) {
                                warn!(requester, %ptr, error = %free_err, "rollback free failed");
                            }
                        }
                    }
                    self.stats_mut().failed_requests += 1;
                    error!(requester, tensor = tensor.name(), size = tensor.size(), error = %e, "allocation failed");
                    return Err(RuntimeError::AllocationFailed {
                        requester: requester.to_string(),
                        reason: format!("{} bytes for {}: {}", tensor.size(), tensor.name(), e),
                    });
                }
            }
        }

        self.stats_mut().allocated_tensors += allocated.len();
        Ok(())
    }

    /// Release one reference of every tensor in `list`; returns how many
    /// tensors had their memory released
    pub fn free(&self, list: &[Arc<DeviceTensor>], requester: &str) -> usize {
        self.stats_mut().free_requests += 1;
        let released = list.iter().filter(|t| self.release(t)).count();
        trace!(requester, released, "free request done");
        released
    }

    /// Drop one reference; frees the memory when the count reaches zero
    ///
    /// Persistent tensors, tensors without memory and repeated releases are
    /// no-ops. Returns whether memory was released.
    pub fn release(&self, tensor: &DeviceTensor) -> bool {
        if tensor.is_persistent() {
            return false;
        }
        if tensor.ref_count() == 0 {
            warn!(tensor = tensor.name(), "release of a tensor with no references left");
            return false;
        }
        if tensor.decrease_ref_count() > 0 {
            return false;
        }
        tensor.reset_ref_count();
        self.free_tensor_memory(tensor)
    }

    /// Free memory regardless of the reference count and restore the count
    ///
    /// Used to unwind a failed run.
    pub fn force_release(&self, tensor: &DeviceTensor) -> bool {
        if tensor.is_persistent() {
            return false;
        }
        tensor.reset_ref_count();
        self.free_tensor_memory(tensor)
    }

    /// Free a persistent tensor's own memory at teardown
    ///
    /// Tensors whose address comes from the static memory plan are only
    /// detached; the plan owns their memory.
    pub fn release_persistent(&self, tensor: &DeviceTensor) -> bool {
        if tensor.is_plan_managed() {
            tensor.clear_ptr();
            return false;
        }
        self.free_tensor_memory(tensor)
    }

    fn free_tensor_memory(&self, tensor: &DeviceTensor) -> bool {
        let (ptr, owned) = tensor.clear_ptr();
        if ptr.is_null() {
            return false;
        }
        if owned {
            if let Err(e) = tensor.device().free(ptr) {
                warn!(tensor = tensor.name(), %ptr, error = %e, "device free failed");
                return false;
            }
        }
        self.stats_mut().released_tensors += 1;
        true
    }

    /// Let in-place outputs borrow their input's memory instead of allocating
    ///
    /// Outputs that already share the input tensor, or whose layout differs
    /// from the input's, are left alone. Returns the
    /// part of `alloc_list` that still needs memory.
    pub fn adopt_ref_outputs(
        &self,
        alloc_list: &[Arc<DeviceTensor>],
        inputs: &[Option<Arc<DeviceTensor>>],
        outputs: &[Arc<DeviceTensor>],
        ref_map: &[(usize, usize)],
    ) -> Vec<Arc<DeviceTensor>> {
        let mut adopted = HashSet::new();
        for (output_index, input_index) in ref_map {
            let (Some(output), Some(Some(input))) =
                (outputs.get(*output_index), inputs.get(*input_index))
            else {
                continue;
            };
            if Arc::ptr_eq(output, input) || !output.ptr().is_null() {
                continue;
            }
            let ptr = input.ptr();
            if ptr.is_null()
                || output.size() > input.size()
                || !output.format().is_equivalent(&input.format())
            {
                continue;
            }
            debug!(output = output.name(), input = input.name(), %ptr, "ref output adopts input memory");
            output.adopt_ptr(ptr);
            adopted.insert(output.id());
        }

        self.stats_mut().adopted_ref_outputs += adopted.len();
        alloc_list
            .iter()
            .filter(|t| !adopted.contains(&t.id()))
            .cloned()
            .collect()
    }
}

enum MemoryRequest {
    Allocate {
        list: Vec<Arc<DeviceTensor>>,
        device: Arc<dyn DeviceContext>,
        requester: String,
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    Free {
        list: Vec<Arc<DeviceTensor>>,
        requester: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Dedicated thread serving memory requests in arrival order
pub struct MemoryService {
    sender: Option<mpsc::UnboundedSender<MemoryRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryService {
    pub fn spawn(manager: Arc<MemoryManager>) -> RuntimeResult<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<MemoryRequest>();
        let handle = std::thread::Builder::new()
            .name("kforge-memory".to_string())
            .spawn(move || {
                while let Some(request) = receiver.blocking_recv() {
                    match request {
                        MemoryRequest::Allocate {
                            list,
                            device,
                            requester,
                            reply,
                        } => {
                            let result = manager.allocate(&list, device.as_ref(), &requester);
                            let _ = reply.send(result);
                        }
                        MemoryRequest::Free {
                            list,
                            requester,
                            reply,
                        } => {
                            let _ = reply.send(manager.free(&list, &requester));
                        }
                    }
                }
                debug!("memory service stopped");
            })
            .map_err(|e| RuntimeError::InternalError(format!("spawn memory service: {}", e)))?;

        Ok(MemoryService {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MemoryRequest,
    ) -> RuntimeResult<T> {
        let closed = || RuntimeError::ChannelClosed("memory service".to_string());
        let (reply, response) = oneshot::channel();
        self.sender
            .as_ref()
            .ok_or_else(closed)?
            .send(build(reply))
            .map_err(|_| closed())?;
        response.blocking_recv().map_err(|_| closed())
    }
}

impl Drop for MemoryService {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryService")
            .field("running", &self.sender.is_some())
            .finish()
    }
}

/// How actors reach the memory manager
#[derive(Debug)]
pub enum MemoryClient {
    /// Caller blocks on the manager's lock
    Direct(Arc<MemoryManager>),
    /// Caller posts a request to the service thread and waits for the reply
    Message {
        manager: Arc<MemoryManager>,
        service: MemoryService,
    },
}

impl MemoryClient {
    pub fn manager(&self) -> &Arc<MemoryManager> {
        match self {
            MemoryClient::Direct(manager) => manager,
            MemoryClient::Message { manager, .. } => manager,
        }
    }

    /// Allocate `list` on `device`; marks `context` failed on error
    pub fn allocate_memory(
        &self,
        list: &[Arc<DeviceTensor>],
        device: &Arc<dyn DeviceContext>,
        context: &OpContext,
        requester: &str,
    ) -> RuntimeResult<()> {
        if list.is_empty() {
            return Ok(());
        }
        let result = match self {
            MemoryClient::Direct(manager) => manager.allocate(list, device.as_ref(), requester),
            MemoryClient::Message { service, .. } => service
                .request(|reply| MemoryRequest::Allocate {
                    list: list.to_vec(),
                    device: device.clone(),
                    requester: requester.to_string(),
                    reply,
                })
                .and_then(|r| r),
        };
        if let Err(e) = &result {
            context.set_failed(e.clone());
        }
        result
    }

    /// Release one reference of every tensor in `list`
    pub fn free_memory(
        &self,
        list: &[Arc<DeviceTensor>],
        context: &OpContext,
        requester: &str,
    ) -> RuntimeResult<usize> {
        if list.is_empty() {
            return Ok(0);
        }
        let result = match self {
            MemoryClient::Direct(manager) => Ok(manager.free(list, requester)),
            MemoryClient::Message { service, .. } => service.request(|reply| MemoryRequest::Free {
                list: list.to_vec(),
                requester: requester.to_string(),
                reply,
            }),
        };
        if let Err(e) = &result {
            context.set_failed(e.clone());
        }
        result
    }
}

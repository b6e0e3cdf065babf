//! Host-memory device context
//!
//! `HostDevice` backs device memory with host buffers and executes kernels
//! synchronously on the calling thread. Stream callbacks are held until the
//! stream is synchronized, which gives the same observable ordering as an
//! asynchronous device: memory released from a callback stays allocated until
//! the stream is known to have passed the kernels that read it.
//!
//! Besides serving CPU graphs, the device records statistics and an event log
//! and supports failure injection, which the scheduler tests rely on.

use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::stream::{CallbackQueues, StreamCallback};
use super::{DeviceContext, DeviceError, DeviceResult, DevicePtr, DeviceType, StreamId};
use crate::kernel::{KernelMod, LaunchArgs};

/// First address handed out; keeps zero free for the null pointer
const BASE_ADDRESS: u64 = 0x1000;

const DEFAULT_ALIGNMENT: usize = 64;

thread_local! {
    static CURRENT_DEVICE: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Observable device operation, in the order the device saw it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceEvent {
    Alloc { ptr: DevicePtr, size: usize },
    Free { ptr: DevicePtr },
    Copy { dst: DevicePtr, src: DevicePtr, size: usize, stream: StreamId },
    Launch { kernel: String, stream: StreamId },
    CallbackRun { stream: StreamId },
}

/// Counters for a host device
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HostDeviceStats {
    pub alloc_count: usize,
    pub free_count: usize,
    pub copy_count: usize,
    pub launch_count: usize,
    pub failed_launches: usize,
    pub callbacks_registered: usize,
    pub callbacks_run: usize,
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub live_allocations: usize,
}

impl fmt::Display for HostDeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostDeviceStats {{ allocs: {}, frees: {}, copies: {}, launches: {} ({} failed), callbacks: {}/{}, in use: {} bytes in {} blocks, peak: {} bytes }}",
            self.alloc_count,
            self.free_count,
            self.copy_count,
            self.launch_count,
            self.failed_launches,
            self.callbacks_run,
            self.callbacks_registered,
            self.bytes_in_use,
            self.live_allocations,
            self.peak_bytes
        )
    }
}

#[derive(Debug)]
struct HostMemory {
    /// Base address -> backing bytes
    blocks: BTreeMap<u64, Vec<u8>>,
    next_addr: u64,
    limit: Option<usize>,
}

impl HostMemory {
    fn bytes_in_use(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    /// Find the block containing `[addr, addr + size)`
    fn locate(&self, ptr: DevicePtr, size: usize) -> DeviceResult<(u64, usize)> {
        if ptr.is_null() {
            return Err(DeviceError::InvalidPointer(ptr));
        }
        let (base, block) = self
            .blocks
            .range(..=ptr.addr())
            .next_back()
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        let offset = (ptr.addr() - base) as usize;
        if offset + size > block.len() {
            return Err(DeviceError::OutOfBounds { ptr, size });
        }
        Ok((*base, offset))
    }

    fn read(&self, ptr: DevicePtr, size: usize) -> DeviceResult<Vec<u8>> {
        let (base, offset) = self.locate(ptr, size)?;
        Ok(self.blocks[&base][offset..offset + size].to_vec())
    }

    fn write(&mut self, ptr: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        let (base, offset) = self.locate(ptr, data.len())?;
        let block = self
            .blocks
            .get_mut(&base)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        block[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Device context backed by host memory
pub struct HostDevice {
    id: u32,
    device_type: DeviceType,
    streams: usize,
    alignment: usize,
    memory: Mutex<HostMemory>,
    callbacks: Mutex<CallbackQueues>,
    stats: Mutex<HostDeviceStats>,
    events: Mutex<Vec<DeviceEvent>>,
    failing_kernels: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostDevice {
    /// Create a CPU device with a single stream and no memory limit
    pub fn new(id: u32) -> Self {
        HostDevice {
            id,
            device_type: DeviceType::Cpu,
            streams: 1,
            alignment: DEFAULT_ALIGNMENT,
            memory: Mutex::new(HostMemory {
                blocks: BTreeMap::new(),
                next_addr: BASE_ADDRESS,
                limit: None,
            }),
            callbacks: Mutex::new(CallbackQueues::new()),
            stats: Mutex::new(HostDeviceStats::default()),
            events: Mutex::new(Vec::new()),
            failing_kernels: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_streams(mut self, streams: usize) -> Self {
        self.streams = streams.max(1);
        self
    }

    /// Report a different device type (simulates a heterogeneous setup)
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_memory_limit(self, bytes: usize) -> Self {
        self.set_memory_limit(Some(bytes));
        self
    }

    /// Change the maximum number of bytes that may be live at once
    pub fn set_memory_limit(&self, bytes: Option<usize>) {
        lock(&self.memory).limit = bytes;
    }

    /// Make every launch of kernels named `name` fail at the device level
    pub fn fail_kernel(&self, name: &str) {
        lock(&self.failing_kernels).insert(name.to_string());
    }

    pub fn clear_kernel_failures(&self) {
        lock(&self.failing_kernels).clear();
    }

    pub fn stats(&self) -> HostDeviceStats {
        let mut stats = lock(&self.stats).clone();
        let memory = lock(&self.memory);
        stats.bytes_in_use = memory.bytes_in_use();
        stats.live_allocations = memory.blocks.len();
        stats
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        lock(&self.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.events).clear();
    }

    /// Whether `ptr` is the base address of a live allocation
    pub fn is_allocated(&self, ptr: DevicePtr) -> bool {
        lock(&self.memory).blocks.contains_key(&ptr.addr())
    }

    pub fn pending_callbacks(&self) -> usize {
        lock(&self.callbacks).total_pending()
    }

    /// Device bound to the calling thread, if any
    pub fn current_thread_device() -> Option<u32> {
        CURRENT_DEVICE.with(Cell::get)
    }

    fn record(&self, event: DeviceEvent) {
        lock(&self.events).push(event);
    }

    fn check_stream(&self, stream: StreamId) -> DeviceResult<()> {
        if self.has_stream(stream) {
            Ok(())
        } else {
            Err(DeviceError::InvalidStream(stream))
        }
    }

    fn aligned(&self, size: usize) -> u64 {
        let size = size.max(1);
        (size.div_ceil(self.alignment) * self.alignment) as u64
    }
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("id", &self.id)
            .field("device_type", &self.device_type)
            .field("streams", &self.streams)
            .finish()
    }
}

impl DeviceContext for HostDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn device_id(&self) -> u32 {
        self.id
    }

    fn allocate(&self, size: usize) -> DeviceResult<DevicePtr> {
        let mut memory = lock(&self.memory);
        let in_use = memory.bytes_in_use();
        if let Some(limit) = memory.limit {
            if in_use + size > limit {
                return Err(DeviceError::OutOfMemory {
                    requested: size,
                    available: limit.saturating_sub(in_use),
                });
            }
        }

        let addr = memory.next_addr;
        memory.next_addr += self.aligned(size);
        memory.blocks.insert(addr, vec![0u8; size]);
        let ptr = DevicePtr::new(addr);
        drop(memory);

        {
            let mut stats = lock(&self.stats);
            stats.alloc_count += 1;
            stats.peak_bytes = stats.peak_bytes.max(in_use + size);
        }
        self.record(DeviceEvent::Alloc { ptr, size });
        trace!(device = self.id, %ptr, size, "allocated");
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        if lock(&self.memory).blocks.remove(&ptr.addr()).is_none() {
            warn!(device = self.id, %ptr, "free of unknown pointer");
            return Err(DeviceError::InvalidPointer(ptr));
        }
        lock(&self.stats).free_count += 1;
        self.record(DeviceEvent::Free { ptr });
        trace!(device = self.id, %ptr, "freed");
        Ok(())
    }

    fn has_stream(&self, stream: StreamId) -> bool {
        (stream as usize) < self.streams
    }

    fn stream_count(&self) -> usize {
        self.streams
    }

    fn copy_device_to_device(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        size: usize,
        stream: StreamId,
    ) -> DeviceResult<()> {
        self.check_stream(stream)?;
        {
            let mut memory = lock(&self.memory);
            let bytes = memory.read(src, size)?;
            memory.write(dst, &bytes)?;
        }
        lock(&self.stats).copy_count += 1;
        self.record(DeviceEvent::Copy {
            dst,
            src,
            size,
            stream,
        });
        Ok(())
    }

    fn write_from_host(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        lock(&self.memory).write(dst, data)
    }

    fn read_to_host(&self, src: DevicePtr, size: usize) -> DeviceResult<Vec<u8>> {
        lock(&self.memory).read(src, size)
    }

    fn launch_kernel(
        &self,
        kernel: &dyn KernelMod,
        args: &LaunchArgs<'_>,
        stream: StreamId,
    ) -> DeviceResult<bool> {
        self.check_stream(stream)?;

        if lock(&self.failing_kernels).contains(kernel.name()) {
            lock(&self.stats).failed_launches += 1;
            return Err(DeviceError::LaunchFailed(format!(
                "injected failure for kernel {}",
                kernel.name()
            )));
        }

        lock(&self.stats).launch_count += 1;
        self.record(DeviceEvent::Launch {
            kernel: kernel.name().to_string(),
            stream,
        });

        // No device lock may be held here: the kernel reads and writes
        // memory through this device.
        let ok = kernel.launch(args, stream, self);
        if !ok {
            lock(&self.stats).failed_launches += 1;
        }
        Ok(ok)
    }

    fn launch_callback(&self, stream: StreamId, callback: StreamCallback) -> DeviceResult<()> {
        self.check_stream(stream)?;
        lock(&self.callbacks).push(stream, callback);
        lock(&self.stats).callbacks_registered += 1;
        Ok(())
    }

    fn sync_stream(&self, stream: StreamId) -> DeviceResult<()> {
        self.check_stream(stream)?;
        let callbacks = lock(&self.callbacks).take(stream);
        if callbacks.is_empty() {
            return Ok(());
        }

        debug!(device = self.id, stream, count = callbacks.len(), "running stream callbacks");
        for callback in callbacks {
            self.record(DeviceEvent::CallbackRun { stream });
            callback();
            lock(&self.stats).callbacks_run += 1;
        }
        Ok(())
    }

    fn bind_device_to_current_thread(&self) -> DeviceResult<()> {
        CURRENT_DEVICE.with(|current| current.set(Some(self.id)));
        Ok(())
    }
}

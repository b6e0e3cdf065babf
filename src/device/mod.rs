//! Device context abstraction
//!
//! The scheduler never talks to a driver directly. Everything it needs from a
//! device (memory, streams, copies, kernel dispatch and stream callbacks) goes
//! through [`DeviceContext`]. [`HostDevice`] is a host-memory implementation
//! used by tests, benches and CPU-only graphs.

pub mod error;
pub mod host;
pub mod stream;

use std::fmt;

use serde::Serialize;

use crate::kernel::{KernelMod, LaunchArgs};

pub use error::{DeviceError, DeviceResult};
pub use host::{DeviceEvent, HostDevice, HostDeviceStats};
pub use stream::{CallbackQueues, StreamCallback};

/// Identifier of a device stream (queue of asynchronous work)
pub type StreamId = u32;

/// Opaque device address. Zero is the null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn new(addr: u64) -> Self {
        DevicePtr(addr)
    }

    pub fn addr(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kind of device a context drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Npu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU"),
            DeviceType::Gpu => write!(f, "GPU"),
            DeviceType::Npu => write!(f, "NPU"),
        }
    }
}

/// Capability set the scheduler needs from one device
///
/// Launches and copies are enqueued on a stream and may complete after the
/// call returns. Work on one stream executes in submission order.
pub trait DeviceContext: Send + Sync + fmt::Debug {
    fn device_type(&self) -> DeviceType;

    fn device_id(&self) -> u32;

    /// Allocate `size` bytes of device memory
    fn allocate(&self, size: usize) -> DeviceResult<DevicePtr>;

    /// Release memory returned by [`DeviceContext::allocate`]
    fn free(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Whether `stream` exists on this device
    fn has_stream(&self, stream: StreamId) -> bool;

    fn stream_count(&self) -> usize;

    /// Copy `size` bytes between two device addresses on `stream`
    fn copy_device_to_device(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        size: usize,
        stream: StreamId,
    ) -> DeviceResult<()>;

    /// Upload host bytes to device memory
    fn write_from_host(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()>;

    /// Download `size` bytes of device memory to the host
    fn read_to_host(&self, src: DevicePtr, size: usize) -> DeviceResult<Vec<u8>>;

    /// Dispatch a kernel launch on `stream`
    ///
    /// `Ok(false)` means the kernel itself reported failure.
    fn launch_kernel(
        &self,
        kernel: &dyn KernelMod,
        args: &LaunchArgs<'_>,
        stream: StreamId,
    ) -> DeviceResult<bool>;

    /// Run `callback` on the host once `stream` reaches this point
    fn launch_callback(&self, stream: StreamId, callback: StreamCallback) -> DeviceResult<()>;

    /// Block until all work queued on `stream` (including callbacks) is done
    fn sync_stream(&self, stream: StreamId) -> DeviceResult<()>;

    /// Block until every stream is idle
    fn sync_all_streams(&self) -> DeviceResult<()> {
        for stream in 0..self.stream_count() as StreamId {
            self.sync_stream(stream)?;
        }
        Ok(())
    }

    /// Make this device current for the calling thread
    fn bind_device_to_current_thread(&self) -> DeviceResult<()>;
}

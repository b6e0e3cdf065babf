//! Device tensors
//!
//! A `DeviceTensor` describes one buffer on one device. Device tensors are
//! created once when the scheduler is built and shared between producer and
//! consumers through `Arc`; every run mutates pointer, size and shape in place.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{DeviceContext, DevicePtr, DeviceType, StreamId};
use crate::kernel::{DType, Format, KernelTensor, TensorInfo};

/// Reference count of tensors that are never released by counting
/// (static memory plan, persistent store)
pub const PERSISTENT_REF_COUNT: usize = usize::MAX;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TensorState {
    ptr: DevicePtr,
    size: usize,
    shape: Vec<usize>,
    dtype: DType,
    format: Format,
    original_ref_count: usize,
    ref_count: usize,
    /// Pointer borrowed from another tensor; releasing it must not free memory
    adopted: bool,
    /// Address resolved from the static memory plan
    plan_managed: bool,
}

/// Buffer descriptor plus device pointer for one operand
pub struct DeviceTensor {
    id: u64,
    name: String,
    device: Arc<dyn DeviceContext>,
    stream_id: StreamId,
    state: Mutex<TensorState>,
}

impl DeviceTensor {
    /// New unallocated tensor with a reference count of one
    pub fn new(
        name: impl Into<String>,
        info: &TensorInfo,
        device: Arc<dyn DeviceContext>,
        stream_id: StreamId,
    ) -> Self {
        DeviceTensor {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            device,
            stream_id,
            state: Mutex::new(TensorState {
                ptr: DevicePtr::NULL,
                size: info.byte_size(),
                shape: info.shape.clone(),
                dtype: info.dtype,
                format: info.format,
                original_ref_count: 1,
                ref_count: 1,
                adopted: false,
                plan_managed: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TensorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<dyn DeviceContext> {
        &self.device
    }

    pub fn device_type(&self) -> DeviceType {
        self.device.device_type()
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn ptr(&self) -> DevicePtr {
        self.state().ptr
    }

    pub fn set_ptr(&self, ptr: DevicePtr) {
        let mut state = self.state();
        state.ptr = ptr;
        state.adopted = false;
    }

    /// Borrow `ptr` from another tensor without taking ownership
    pub fn adopt_ptr(&self, ptr: DevicePtr) {
        let mut state = self.state();
        state.ptr = ptr;
        state.adopted = true;
    }

    pub fn is_adopted(&self) -> bool {
        self.state().adopted
    }

    /// Null the pointer, returning the previous value and whether it was owned
    pub fn clear_ptr(&self) -> (DevicePtr, bool) {
        let mut state = self.state();
        let ptr = std::mem::replace(&mut state.ptr, DevicePtr::NULL);
        let owned = !std::mem::replace(&mut state.adopted, false);
        (ptr, owned)
    }

    pub fn size(&self) -> usize {
        self.state().size
    }

    pub fn set_size(&self, size: usize) {
        self.state().size = size;
    }

    pub fn shape(&self) -> Vec<usize> {
        self.state().shape.clone()
    }

    pub fn set_shape(&self, shape: Vec<usize>) {
        self.state().shape = shape;
    }

    /// Set the shape and derive the byte size from it
    pub fn update_shape(&self, shape: Vec<usize>) {
        let mut state = self.state();
        state.size = shape.iter().product::<usize>() * state.dtype.size_in_bytes();
        state.shape = shape;
    }

    pub fn dtype(&self) -> DType {
        self.state().dtype
    }

    pub fn set_dtype(&self, dtype: DType) {
        self.state().dtype = dtype;
    }

    pub fn format(&self) -> Format {
        self.state().format
    }

    pub fn info(&self) -> TensorInfo {
        let state = self.state();
        TensorInfo {
            shape: state.shape.clone(),
            dtype: state.dtype,
            format: state.format,
        }
    }

    pub fn mark_plan_managed(&self) {
        let mut state = self.state();
        state.plan_managed = true;
        state.original_ref_count = PERSISTENT_REF_COUNT;
        state.ref_count = PERSISTENT_REF_COUNT;
    }

    pub fn is_plan_managed(&self) -> bool {
        self.state().plan_managed
    }

    pub fn original_ref_count(&self) -> usize {
        self.state().original_ref_count
    }

    pub fn ref_count(&self) -> usize {
        self.state().ref_count
    }

    /// Set the count restored after every release; also resets the current count
    pub fn set_original_ref_count(&self, count: usize) {
        let mut state = self.state();
        state.original_ref_count = count;
        state.ref_count = count;
    }

    pub fn is_persistent(&self) -> bool {
        self.state().original_ref_count == PERSISTENT_REF_COUNT
    }

    pub fn increase_ref_count(&self, n: usize) {
        let mut state = self.state();
        if state.original_ref_count != PERSISTENT_REF_COUNT {
            state.ref_count += n;
        }
    }

    /// Decrement and return the remaining count
    pub fn decrease_ref_count(&self) -> usize {
        let mut state = self.state();
        if state.original_ref_count != PERSISTENT_REF_COUNT && state.ref_count > 0 {
            state.ref_count -= 1;
        }
        state.ref_count
    }

    pub fn reset_ref_count(&self) {
        let mut state = self.state();
        state.ref_count = state.original_ref_count;
    }

    /// Snapshot for kernel inference and launch
    pub fn kernel_tensor(&self) -> KernelTensor {
        let state = self.state();
        KernelTensor {
            ptr: state.ptr,
            size: state.size,
            shape: state.shape.clone(),
            dtype: state.dtype,
            format: state.format,
            stream_id: self.stream_id,
        }
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("DeviceTensor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ptr", &state.ptr)
            .field("size", &state.size)
            .field("shape", &state.shape)
            .field("ref_count", &state.ref_count)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

//! Shared fixtures for scheduler integration tests
//!
//! Test kernels run on [`HostDevice`] and read and write their operands
//! through the device, so every launch exercises real device pointers.
//! Kernels that tests need to observe share an [`Arc<KernelLog>`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kernelforge::context::RuntimeContext;
use kernelforge::device::{DeviceContext, DevicePtr, HostDevice, StreamId};
use kernelforge::kernel::{
    bytes_to_f32, f32_to_bytes, DType, KernelMod, KernelTensor, LaunchArgs, ResizeStatus,
    TensorInfo,
};
use kernelforge::scheduler::{GraphScheduler, SchedulerConfig};
use kernelforge::{HostTensor, KernelGraph};

pub use serial_test::serial;

/// What the test kernels did, in order
#[derive(Debug, Default)]
pub struct KernelLog {
    events: Mutex<Vec<String>>,
    launches: AtomicUsize,
    output_ptrs: Mutex<Vec<DevicePtr>>,
}

impl KernelLog {
    pub fn new() -> Arc<Self> {
        Arc::new(KernelLog::default())
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Output pointer of every launch, in launch order
    pub fn output_ptrs(&self) -> Vec<DevicePtr> {
        self.output_ptrs.lock().unwrap().clone()
    }

    fn launched(&self, name: &str, output: Option<&KernelTensor>) {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(output) = output {
            self.output_ptrs.lock().unwrap().push(output.ptr);
        }
        self.push(format!("launch:{}", name));
    }
}

pub fn f32_info(len: usize) -> TensorInfo {
    TensorInfo::new(vec![len], DType::F32)
}

pub fn read_f32(device: &dyn DeviceContext, tensor: &KernelTensor) -> Option<Vec<f32>> {
    if tensor.size == 0 {
        return Some(Vec::new());
    }
    device.read_to_host(tensor.ptr, tensor.size).ok().map(|b| bytes_to_f32(&b))
}

pub fn write_f32(device: &dyn DeviceContext, tensor: &KernelTensor, values: &[f32]) -> bool {
    values.is_empty() || device.write_from_host(tensor.ptr, &f32_to_bytes(values)).is_ok()
}

/// `out = in * factor` over a fixed length
pub struct Scale {
    name: String,
    factor: f32,
    len: usize,
    log: Option<Arc<KernelLog>>,
    delay: Option<Duration>,
}

impl Scale {
    pub fn new(name: &str, factor: f32, len: usize) -> Self {
        Scale {
            name: name.to_string(),
            factor,
            len,
            log: None,
            delay: None,
        }
    }

    pub fn logged(mut self, log: &Arc<KernelLog>) -> Self {
        self.log = Some(log.clone());
        self
    }

    /// Sleep inside every launch
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl KernelMod for Scale {
    fn name(&self) -> &str {
        &self.name
    }

    fn resize(&mut self, _: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
        ResizeStatus::Ok
    }

    fn launch(&self, args: &LaunchArgs<'_>, _: StreamId, device: &dyn DeviceContext) -> bool {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(log) = &self.log {
            log.launched(&self.name, args.outputs.first());
        }
        let Some(input) = read_f32(device, &args.inputs[0]) else {
            return false;
        };
        let scaled: Vec<f32> = input.iter().map(|v| v * self.factor).collect();
        write_f32(device, &args.outputs[0], &scaled)
    }

    fn output_size_list(&self) -> Vec<usize> {
        vec![self.len * 4]
    }
}

/// `out = a + b`
pub struct Add {
    name: String,
    len: usize,
}

impl Add {
    pub fn new(name: &str, len: usize) -> Self {
        Add {
            name: name.to_string(),
            len,
        }
    }
}

impl KernelMod for Add {
    fn name(&self) -> &str {
        &self.name
    }

    fn resize(&mut self, _: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
        ResizeStatus::Ok
    }

    fn launch(&self, args: &LaunchArgs<'_>, _: StreamId, device: &dyn DeviceContext) -> bool {
        let (Some(a), Some(b)) = (read_f32(device, &args.inputs[0]), read_f32(device, &args.inputs[1]))
        else {
            return false;
        };
        let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        write_f32(device, &args.outputs[0], &sum)
    }

    fn output_size_list(&self) -> Vec<usize> {
        vec![self.len * 4]
    }
}

/// Dynamic-shape identity
///
/// Output shape follows input 0; resize allocates one 16-byte workspace per
/// four elements. Every launch checks that the output size it is handed
/// matches what the last resize reported.
pub struct Dynamic {
    name: String,
    len: usize,
    workspaces: Vec<usize>,
    needs_user_data: bool,
    log: Arc<KernelLog>,
    size_mismatches: Arc<AtomicUsize>,
}

impl Dynamic {
    pub fn new(name: &str, log: &Arc<KernelLog>) -> Self {
        Dynamic {
            name: name.to_string(),
            len: 0,
            workspaces: Vec::new(),
            needs_user_data: false,
            log: log.clone(),
            size_mismatches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_user_data(mut self) -> Self {
        self.needs_user_data = true;
        self
    }

    pub fn mismatch_counter(&self) -> Arc<AtomicUsize> {
        self.size_mismatches.clone()
    }
}

impl KernelMod for Dynamic {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer_shape(
        &self,
        inputs: &[KernelTensor],
        _: &[KernelTensor],
    ) -> kernelforge::kernel::KernelResult<Vec<Vec<usize>>> {
        self.log.push(format!("infer:{}", self.name));
        Ok(vec![inputs[0].shape.clone()])
    }

    fn resize(&mut self, inputs: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
        self.log.push(format!("resize:{}", self.name));
        self.len = inputs[0].element_count();
        self.workspaces = vec![16; self.len / 4];
        ResizeStatus::Ok
    }

    fn launch(&self, args: &LaunchArgs<'_>, _: StreamId, device: &dyn DeviceContext) -> bool {
        self.log.launched(&self.name, args.outputs.first());
        if args.outputs[0].size != self.len * 4 || args.workspace.len() != self.workspaces.len() {
            self.size_mismatches.fetch_add(1, Ordering::SeqCst);
        }
        let Some(input) = read_f32(device, &args.inputs[0]) else {
            return false;
        };
        write_f32(device, &args.outputs[0], &input)
    }

    fn output_size_list(&self) -> Vec<usize> {
        vec![self.len * 4]
    }

    fn workspace_size_list(&self) -> Vec<usize> {
        self.workspaces.clone()
    }

    fn need_user_data(&self) -> bool {
        self.needs_user_data
    }
}

/// In-place identity; launching it at all is only needed when the output
/// does not alias the input
pub struct InPlace {
    log: Arc<KernelLog>,
    len: usize,
}

impl InPlace {
    pub fn new(len: usize, log: &Arc<KernelLog>) -> Self {
        InPlace {
            log: log.clone(),
            len,
        }
    }
}

impl KernelMod for InPlace {
    fn name(&self) -> &str {
        "InPlace"
    }

    fn resize(&mut self, _: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
        ResizeStatus::Ok
    }

    fn launch(&self, args: &LaunchArgs<'_>, stream: StreamId, device: &dyn DeviceContext) -> bool {
        self.log.launched("InPlace", args.outputs.first());
        device
            .copy_device_to_device(args.outputs[0].ptr, args.inputs[0].ptr, args.outputs[0].size, stream)
            .is_ok()
    }

    fn output_size_list(&self) -> Vec<usize> {
        vec![self.len * 4]
    }
}

/// `out = in + 1`, written through the output (usually aliasing the input)
pub struct Accumulate {
    len: usize,
}

impl Accumulate {
    pub fn new(len: usize) -> Self {
        Accumulate { len }
    }
}

impl KernelMod for Accumulate {
    fn name(&self) -> &str {
        "Accumulate"
    }

    fn resize(&mut self, _: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
        ResizeStatus::Ok
    }

    fn launch(&self, args: &LaunchArgs<'_>, _: StreamId, device: &dyn DeviceContext) -> bool {
        let Some(values) = read_f32(device, &args.inputs[0]) else {
            return false;
        };
        let next: Vec<f32> = values.iter().map(|v| v + 1.0).collect();
        write_f32(device, &args.outputs[0], &next)
    }

    fn output_size_list(&self) -> Vec<usize> {
        vec![self.len * 4]
    }
}

pub fn host_device() -> Arc<HostDevice> {
    Arc::new(HostDevice::new(0))
}

pub fn config() -> SchedulerConfig {
    SchedulerConfig::new().with_worker_threads(2)
}

pub fn build(graph: KernelGraph, device: &Arc<HostDevice>, config: SchedulerConfig) -> GraphScheduler {
    kernelforge::logging::init_logging_default();
    let runtime = RuntimeContext::new(config).unwrap();
    let devices: Vec<Arc<dyn DeviceContext>> = vec![device.clone()];
    GraphScheduler::build(graph, devices, runtime).unwrap()
}

pub fn input(values: &[f32]) -> HostTensor {
    HostTensor::from_f32(vec![values.len()], values)
}

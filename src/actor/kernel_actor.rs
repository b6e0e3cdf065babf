//! Kernel actor
//!
//! One actor per graph node. An actor collects the data and control messages
//! of an op context until its dependency count reaches zero, then fires:
//!
//! 1. fetch inputs (messages, persistent store, remote payload) and copy the
//!    ones whose device or format does not match into per-slot scratch tensors
//! 2. infer output shapes (dynamic nodes, per the stage table)
//! 3. resize, then refresh output and workspace sizes
//! 4. resolve static memory plan addresses
//! 5. allocate `memory_alloc_list`
//! 6. launch on the node's stream
//! 7. defer the release of inputs produced on other streams
//! 8. read back final output shapes if the kernel asks for it
//! 9. free `memory_free_list`
//! 10. emit output data messages, then control messages
//!
//! A failing step records its error on the op context and the firing emits
//! nothing. Successors therefore never become runnable for that context.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use super::callback::{run_counted, CallbackCounter};
use super::context::OpContext;
use super::recv::{behavior_for, ActorBehavior, RemoteState};
use super::types::{
    ActorId, ActorPhase, ActorVariant, ArrowTarget, DataArrow, DispatchState, OpControl, OpData,
    Outgoing, PhaseTracker, RemoteMessage,
};
use crate::context::RuntimeContext;
use crate::device::{DeviceContext, StreamId};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{GraphNode, InputSource, NodeId};
use crate::kernel::{
    DType, InferStage, KernelMod, KernelTensor, LaunchArgs, ResizeStatus, ShapeKind, StagePlan,
    TensorInfo,
};
use crate::memory::{DeviceTensor, SomasPlan};
use crate::scheduler::Telemetry;

/// Shared services an actor works with
#[derive(Debug, Clone)]
pub struct ActorEnv {
    pub runtime: Arc<RuntimeContext>,
    /// Device the node runs on
    pub device: Arc<dyn DeviceContext>,
    /// Static memory plan, when enabled
    pub somas: Option<Arc<SomasPlan>>,
    pub telemetry: Arc<Telemetry>,
    pub callbacks: Arc<CallbackCounter>,
    /// Defer release of inputs produced on other streams
    pub multi_stream: bool,
}

/// Device tensors wired to the actor at build time
#[derive(Debug, Default)]
pub struct ActorWiring {
    pub outputs: Vec<Arc<DeviceTensor>>,
    /// Outputs that are the very tensor of their in-place input
    pub shared_outputs: HashSet<usize>,
    /// Landing tensor of remote payloads (receive actors)
    pub remote_input: Option<Arc<DeviceTensor>>,
}

/// Delivery result of a remote message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDelivery {
    Accepted { runnable: bool },
    /// The context already has its remote input; kept for a later run
    Queued,
}

#[derive(Debug)]
struct PendingContext {
    datas: Vec<Option<Arc<DeviceTensor>>>,
    remaining: usize,
    remote_received: bool,
    state: DispatchState,
}

impl PendingContext {
    fn advance(&mut self, actor: &str, next: DispatchState) -> RuntimeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(RuntimeError::InvalidStateTransition {
                actor: actor.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Count one arrived dependency; true when this made the actor runnable
    fn arrive(&mut self, actor: &str) -> RuntimeResult<bool> {
        if self.remaining == 0 {
            return Err(RuntimeError::InternalError(format!(
                "{} received more messages than it depends on",
                actor
            )));
        }
        self.remaining -= 1;
        self.try_runnable(actor)
    }

    fn try_runnable(&mut self, actor: &str) -> RuntimeResult<bool> {
        if self.remaining == 0 && self.state == DispatchState::WaitingDependencies {
            self.advance(actor, DispatchState::Runnable)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Per-firing working set, guarded by the actor's state lock
struct ActorState {
    kernel: Box<dyn KernelMod>,
    phase: PhaseTracker,
    /// Inputs as fetched this firing
    fetched_inputs: Vec<Arc<DeviceTensor>>,
    /// Inputs handed to the kernel (scratch copies substituted)
    launch_inputs: Vec<Arc<DeviceTensor>>,
    copy_slots: Vec<Option<Arc<DeviceTensor>>>,
    workspaces: Vec<Arc<DeviceTensor>>,
    memory_alloc_list: Vec<Arc<DeviceTensor>>,
    memory_free_list: Vec<Arc<DeviceTensor>>,
    /// Input entries at the head of `memory_free_list`
    free_list_inputs: usize,
}

pub struct KernelActor {
    id: ActorId,
    name: String,
    kernel_name: String,
    variant: ActorVariant,
    behavior: Box<dyn ActorBehavior>,
    inputs: Vec<InputSource>,
    input_infos: Vec<TensorInfo>,
    outputs: Vec<Arc<DeviceTensor>>,
    shared_outputs: HashSet<usize>,
    remote_input: Option<Arc<DeviceTensor>>,
    ref_map: Vec<(usize, usize)>,
    shape_kind: ShapeKind,
    stage_plan: StagePlan,
    stream_id: StreamId,
    output_offsets: Vec<Option<usize>>,
    workspace_offsets: Vec<Option<usize>>,
    launch_skippable: bool,
    continuous_inputs: bool,
    ignored_inputs: HashSet<usize>,
    need_user_data: bool,
    input_datas_num: usize,
    input_controls_num: usize,
    control_deps: Vec<NodeId>,
    output_data_arrows: Vec<DataArrow>,
    output_control_arrows: Vec<ActorId>,
    env: ActorEnv,
    pending: Mutex<HashMap<u64, PendingContext>>,
    inbox: Mutex<VecDeque<RemoteMessage>>,
    remote: Mutex<RemoteState>,
    state: Mutex<ActorState>,
}

impl KernelActor {
    pub fn new(id: ActorId, node: GraphNode, wiring: ActorWiring, env: ActorEnv) -> Self {
        let input_datas_num = node
            .inputs
            .iter()
            .filter(|s| matches!(s, InputSource::Node { .. } | InputSource::GraphInput(_)))
            .count();
        let placement = node.somas.unwrap_or_default();
        let ignored_inputs = node.kernel.launch_ignored_inputs().into_iter().collect();
        let need_user_data = node.kernel.need_user_data();
        let kernel_name = node.kernel.name().to_string();
        let input_count = node.inputs.len();

        KernelActor {
            id,
            kernel_name,
            behavior: behavior_for(&node.variant),
            variant: node.variant,
            inputs: node.inputs,
            input_infos: node.input_infos,
            outputs: wiring.outputs,
            shared_outputs: wiring.shared_outputs,
            remote_input: wiring.remote_input,
            ref_map: node.ref_map,
            shape_kind: node.shape_kind,
            stage_plan: node.shape_kind.stage_plan(),
            stream_id: node.stream_id,
            output_offsets: placement.outputs,
            workspace_offsets: placement.workspaces,
            launch_skippable: node.launch_skippable,
            continuous_inputs: node.continuous_inputs,
            ignored_inputs,
            need_user_data,
            input_datas_num,
            input_controls_num: node.control_deps.len(),
            control_deps: node.control_deps,
            output_data_arrows: Vec::new(),
            output_control_arrows: Vec::new(),
            env,
            pending: Mutex::new(HashMap::new()),
            inbox: Mutex::new(VecDeque::new()),
            remote: Mutex::new(RemoteState::default()),
            state: Mutex::new(ActorState {
                kernel: node.kernel,
                phase: PhaseTracker::new(&node.name),
                fetched_inputs: Vec::new(),
                launch_inputs: Vec::new(),
                copy_slots: vec![None; input_count],
                workspaces: Vec::new(),
                memory_alloc_list: Vec::new(),
                memory_free_list: Vec::new(),
                free_list_inputs: 0,
            }),
            name: node.name,
        }
    }

    fn state(&self) -> MutexGuard<'_, ActorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingContext>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbox(&self) -> MutexGuard<'_, VecDeque<RemoteMessage>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remote(&self) -> MutexGuard<'_, RemoteState> {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_output_arrow(&mut self, from_output: usize, target: ArrowTarget) -> RuntimeResult<()> {
        if from_output >= self.outputs.len() {
            return Err(RuntimeError::IndexOutOfRange {
                node: self.name.clone(),
                what: "output arrow",
                index: from_output,
                len: self.outputs.len(),
            });
        }
        self.output_data_arrows.push(DataArrow {
            from_output,
            target,
        });
        Ok(())
    }

    pub fn add_control_arrow(&mut self, to: ActorId) {
        self.output_control_arrows.push(to);
    }

    /// Validate the node and build workspaces and the alloc/free lists
    pub fn init(&self) -> RuntimeResult<()> {
        self.behavior.on_init(&self.name, &self.inputs)?;

        let device = &self.env.device;
        if !device.has_stream(self.stream_id) {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "node {} uses stream {} but device {} has {} streams",
                self.name,
                self.stream_id,
                device.device_id(),
                device.stream_count()
            )));
        }

        let placed = self
            .output_offsets
            .iter()
            .chain(self.workspace_offsets.iter())
            .any(Option::is_some);
        if placed && self.shape_kind.sizes_may_change() {
            return Err(RuntimeError::SomasDynamicConflict(self.name.clone()));
        }
        if placed && self.env.somas.is_none() {
            return Err(RuntimeError::SomasDisabled(self.name.clone()));
        }
        if self.output_offsets.len() > self.outputs.len() {
            return Err(RuntimeError::IndexOutOfRange {
                node: self.name.clone(),
                what: "somas output placement",
                index: self.output_offsets.len() - 1,
                len: self.outputs.len(),
            });
        }
        if self.launch_skippable && (self.inputs.is_empty() || self.outputs.is_empty()) {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "launch-skippable node {} needs at least one input and one output",
                self.name
            )));
        }

        let mut state = self.state();
        let sizes = state.kernel.output_size_list();
        if sizes.len() != self.outputs.len() {
            return Err(RuntimeError::ArityMismatch {
                node: self.name.clone(),
                what: "output size list",
                expected: self.outputs.len(),
                actual: sizes.len(),
            });
        }
        for (index, (output, size)) in self.outputs.iter().zip(sizes).enumerate() {
            if self.shared_outputs.contains(&index) {
                continue;
            }
            output.set_size(size);
            if self.output_offset(index).is_some() {
                output.mark_plan_managed();
            }
        }

        let workspace_sizes = state.kernel.workspace_size_list();
        state.workspaces = workspace_sizes
            .iter()
            .enumerate()
            .map(|(i, size)| self.make_workspace(i, *size))
            .collect();

        state.memory_alloc_list = self.dynamic_outputs().collect();
        state.memory_free_list = state.memory_alloc_list.clone();
        self.rebuild_workspace_tails(&mut state);

        debug!(
            actor = %self.id,
            node = %self.name,
            kernel = %self.kernel_name,
            shape_kind = %self.shape_kind,
            allocs = state.memory_alloc_list.len(),
            workspaces = state.workspaces.len(),
            "actor initialized"
        );
        Ok(())
    }

    fn output_offset(&self, index: usize) -> Option<usize> {
        self.output_offsets.get(index).copied().flatten()
    }

    fn workspace_offset(&self, index: usize) -> Option<usize> {
        self.workspace_offsets.get(index).copied().flatten()
    }

    /// Outputs this actor allocates and frees itself
    fn dynamic_outputs(&self) -> impl Iterator<Item = Arc<DeviceTensor>> + '_ {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.shared_outputs.contains(i) && self.output_offset(*i).is_none())
            .map(|(_, t)| t.clone())
    }

    fn make_workspace(&self, index: usize, size: usize) -> Arc<DeviceTensor> {
        let tensor = DeviceTensor::new(
            format!("{}:workspace{}", self.name, index),
            &TensorInfo::new(vec![size], DType::U8),
            self.env.device.clone(),
            self.stream_id,
        );
        if self.workspace_offset(index).is_some() {
            tensor.mark_plan_managed();
        }
        Arc::new(tensor)
    }

    /// Re-append the dynamic workspaces after the fixed list prefixes
    fn rebuild_workspace_tails(&self, state: &mut ActorState) {
        let output_count = self.dynamic_outputs().count();
        let workspaces: Vec<Arc<DeviceTensor>> = state
            .workspaces
            .iter()
            .filter(|w| !w.is_plan_managed())
            .cloned()
            .collect();

        state.memory_alloc_list.truncate(output_count);
        state.memory_alloc_list.extend(workspaces.iter().cloned());

        let free_prefix = state.free_list_inputs + output_count;
        state.memory_free_list.truncate(free_prefix);
        state.memory_free_list.extend(workspaces);
    }

    fn dependency_count(&self) -> usize {
        self.input_datas_num + self.input_controls_num + self.behavior.remote_inputs()
    }

    fn new_pending(&self) -> PendingContext {
        PendingContext {
            datas: vec![None; self.inputs.len()],
            remaining: self.dependency_count(),
            remote_received: false,
            state: DispatchState::WaitingDependencies,
        }
    }

    /// Store a data message; true when the actor became runnable
    pub fn receive_data(&self, context: &OpContext, data: OpData) -> RuntimeResult<bool> {
        let slot = data.index;
        match self.inputs.get(slot) {
            Some(InputSource::Node { .. }) | Some(InputSource::GraphInput(_)) => {}
            Some(_) => {
                return Err(RuntimeError::InternalError(format!(
                    "{} input {} is not fed by data messages",
                    self.name, slot
                )))
            }
            None => {
                return Err(RuntimeError::IndexOutOfRange {
                    node: self.name.clone(),
                    what: "input",
                    index: slot,
                    len: self.inputs.len(),
                })
            }
        }
        trace!(actor = %self.id, from = %data.from, slot, sequence = context.sequence(), "data received");

        let mut pending = self.pending();
        let entry = pending
            .entry(context.sequence())
            .or_insert_with(|| self.new_pending());
        if entry.datas[slot].is_some() {
            return Err(RuntimeError::InternalError(format!(
                "{} input {} received twice in context {}",
                self.name,
                slot,
                context.sequence()
            )));
        }
        entry.datas[slot] = Some(data.tensor);
        entry.arrive(&self.name)
    }

    pub fn receive_control(&self, context: &OpContext, control: OpControl) -> RuntimeResult<bool> {
        trace!(actor = %self.id, from = %control.from, sequence = context.sequence(), "control received");
        let mut pending = self.pending();
        pending
            .entry(context.sequence())
            .or_insert_with(|| self.new_pending())
            .arrive(&self.name)
    }

    /// Upload a remote payload for this context, or queue it if the context
    /// already has one
    pub fn receive_remote(
        &self,
        context: &OpContext,
        message: RemoteMessage,
    ) -> RuntimeResult<RemoteDelivery> {
        self.accept_remote(&message)?;
        let remote = self.remote_input.as_ref().ok_or_else(|| {
            RuntimeError::InternalError(format!("{} has no remote input tensor", self.name))
        })?;

        let mut pending = self.pending();
        let entry = pending
            .entry(context.sequence())
            .or_insert_with(|| self.new_pending());
        if entry.remote_received || entry.state != DispatchState::WaitingDependencies {
            debug!(actor = %self.id, from = %message.from, "remote message queued for a later run");
            self.inbox().push_back(message);
            return Ok(RemoteDelivery::Queued);
        }

        let payload = &message.payload;
        remote.update_shape(payload.info.shape.clone());
        remote.set_size(payload.data.len());
        if remote.ptr().is_null() {
            self.env.runtime.memory().allocate_memory(
                std::slice::from_ref(remote),
                &self.env.device,
                context,
                &self.name,
            )?;
        }
        if !payload.data.is_empty() {
            self.env.device.write_from_host(remote.ptr(), &payload.data)?;
        }
        debug!(actor = %self.id, from = %message.from, bytes = payload.data.len(), "remote payload uploaded");

        self.remote().received_from = Some(message.from);
        entry.remote_received = true;
        let runnable = entry.arrive(&self.name)?;
        Ok(RemoteDelivery::Accepted { runnable })
    }

    fn accept_remote(&self, message: &RemoteMessage) -> RuntimeResult<()> {
        self.behavior.on_message(&self.name, message)?;
        let expected = self.input_infos.first().map(|i| i.dtype);
        if expected != Some(message.payload.info.dtype) {
            return Err(RuntimeError::MessageRejected {
                actor: self.name.clone(),
                from: message.from.clone(),
                reason: format!(
                    "payload type {:?} does not match {:?}",
                    message.payload.info.dtype, expected
                ),
            });
        }
        Ok(())
    }

    /// Park a remote message until the next run starts
    pub fn queue_remote(&self, message: RemoteMessage) -> RuntimeResult<()> {
        self.accept_remote(&message)?;
        debug!(actor = %self.id, from = %message.from, "remote message parked");
        self.inbox().push_back(message);
        Ok(())
    }

    pub fn next_queued_remote(&self) -> Option<RemoteMessage> {
        self.inbox().pop_front()
    }

    pub fn queued_remote(&self) -> usize {
        self.inbox().len()
    }

    /// Make an actor without dependencies runnable for `context`
    pub fn mark_runnable(&self, context: &OpContext) -> RuntimeResult<bool> {
        let mut pending = self.pending();
        pending
            .entry(context.sequence())
            .or_insert_with(|| self.new_pending())
            .try_runnable(&self.name)
    }

    pub fn dispatch_state(&self, sequence: u64) -> Option<DispatchState> {
        self.pending().get(&sequence).map(|p| p.state)
    }

    /// Erase the input state of a finished context
    pub fn clear_context(&self, sequence: u64) {
        self.pending().remove(&sequence);
        self.behavior.on_clear(&mut self.remote());
    }

    /// Whether a firing must wait for the stage executors to drain first
    pub fn needs_user_data(&self) -> bool {
        self.shape_kind.has_dynamic() && self.need_user_data
    }

    fn abort_if_failed(&self, context: &OpContext, state: &mut ActorState) -> bool {
        if !context.is_failed() {
            return false;
        }
        debug!(actor = %self.id, node = %self.name, phase = %state.phase.phase(), "context failed, aborting");
        state.phase.reset();
        self.env.telemetry.record_abort(&self.name);
        true
    }

    /// Start a firing: claim the context's inputs and fetch them
    ///
    /// `drain` is called before any work that needs all queued stage tasks to
    /// have finished. Returns `false` when the context already failed.
    pub fn begin(&self, context: &OpContext, drain: Option<&dyn Fn()>) -> RuntimeResult<bool> {
        let datas = {
            let mut pending = self.pending();
            let entry = pending.get_mut(&context.sequence()).ok_or_else(|| {
                RuntimeError::InternalError(format!(
                    "{} fired without inputs for context {}",
                    self.name,
                    context.sequence()
                ))
            })?;
            entry.advance(&self.name, DispatchState::Running)?;
            std::mem::take(&mut entry.datas)
        };

        let mut state = self.state();
        if self.abort_if_failed(context, &mut state) {
            return Ok(false);
        }
        self.env.telemetry.record_fire(&self.name);
        if self.behavior.remote_inputs() > 0 {
            self.behavior.on_run(&mut self.remote());
        }

        let mut drained = false;
        if let Some(drain) = drain {
            if self.needs_user_data() {
                drain();
                drained = true;
            }
        }
        let started = Instant::now();
        self.fetch_inputs(&mut state, datas, context, drain.filter(|_| !drained))?;
        trace!(actor = %self.id, elapsed_us = started.elapsed().as_micros() as u64, "inputs fetched");
        Ok(true)
    }

    fn fetch_inputs(
        &self,
        state: &mut ActorState,
        mut datas: Vec<Option<Arc<DeviceTensor>>>,
        context: &OpContext,
        mut drain: Option<&dyn Fn()>,
    ) -> RuntimeResult<()> {
        let store = self.env.runtime.tensor_store();
        let device_type = self.env.device.device_type();

        let mut fetched = Vec::with_capacity(self.inputs.len());
        for (slot, source) in self.inputs.iter().enumerate() {
            let tensor = match source {
                InputSource::Node { .. } | InputSource::GraphInput(_) => {
                    datas.get_mut(slot).and_then(Option::take).ok_or_else(|| {
                        RuntimeError::InternalError(format!(
                            "{} input {} missing at fire time",
                            self.name, slot
                        ))
                    })?
                }
                InputSource::Parameter(key) => match store.fetch(key, device_type)? {
                    Some(tensor) => tensor,
                    None => store
                        .fetch_any(key)?
                        .ok_or_else(|| RuntimeError::ParameterNotBound(key.clone()))?,
                },
                InputSource::Remote => self.remote_input.clone().ok_or_else(|| {
                    RuntimeError::InternalError(format!("{} has no remote input tensor", self.name))
                })?,
            };
            let unbound = matches!(source, InputSource::Parameter(_))
                && tensor.ptr().is_null()
                && tensor.size() > 0;
            if unbound && !self.ignored_inputs.contains(&slot) {
                return Err(RuntimeError::ParameterNotBound(tensor.name().to_string()));
            }
            fetched.push(tensor);
        }

        let mut launch_inputs = Vec::with_capacity(fetched.len());
        for (slot, tensor) in fetched.iter().enumerate() {
            if self.ignored_inputs.contains(&slot) || !self.needs_copy(slot, tensor) {
                launch_inputs.push(tensor.clone());
                continue;
            }
            if self.continuous_inputs {
                return Err(RuntimeError::CopyFailed {
                    node: self.name.clone(),
                    input_index: slot,
                    reason: "inputs of this node must be one continuous block".to_string(),
                });
            }
            if let Some(drain) = drain.take() {
                drain();
            }
            let copy = self.copy_input(state, slot, tensor, context)?;
            self.env.telemetry.record_copy(&self.name);
            launch_inputs.push(copy);
        }

        let head = state.free_list_inputs;
        state.memory_free_list.splice(0..head, fetched.iter().cloned());
        state.free_list_inputs = fetched.len();
        state.fetched_inputs = fetched;
        state.launch_inputs = launch_inputs;
        Ok(())
    }

    fn needs_copy(&self, slot: usize, tensor: &DeviceTensor) -> bool {
        let expected = &self.input_infos[slot];
        tensor.device_type() != self.env.device.device_type()
            || !tensor.format().is_equivalent(&expected.format)
    }

    /// Copy `source` into the slot's scratch tensor in the expected format
    fn copy_input(
        &self,
        state: &mut ActorState,
        slot: usize,
        source: &Arc<DeviceTensor>,
        context: &OpContext,
    ) -> RuntimeResult<Arc<DeviceTensor>> {
        let expected = &self.input_infos[slot];
        let size = source.size();
        let manager = self.env.runtime.memory_manager();

        let scratch = match &state.copy_slots[slot] {
            Some(existing) => {
                if existing.size() != size {
                    debug!(node = %self.name, slot, old = existing.size(), new = size, "input copy resized");
                    manager.force_release(existing);
                    existing.set_size(size);
                }
                existing.clone()
            }
            None => {
                let info = TensorInfo {
                    shape: source.shape(),
                    dtype: source.dtype(),
                    format: expected.format,
                };
                let tensor = Arc::new(DeviceTensor::new(
                    format!("{}:copy{}", self.name, slot),
                    &info,
                    self.env.device.clone(),
                    self.stream_id,
                ));
                tensor.set_size(size);
                state.copy_slots[slot] = Some(tensor.clone());
                tensor
            }
        };
        scratch.set_shape(source.shape());
        scratch.set_dtype(source.dtype());
        if self.ref_map.iter().any(|(_, input)| *input == slot) {
            self.env.runtime.copy_store().insert(&scratch, source)?;
        }

        if scratch.ptr().is_null() {
            self.env.runtime.memory().allocate_memory(
                std::slice::from_ref(&scratch),
                &self.env.device,
                context,
                &self.name,
            )?;
        }
        if size == 0 {
            return Ok(scratch);
        }

        let copy_failed = |reason: String| RuntimeError::CopyFailed {
            node: self.name.clone(),
            input_index: slot,
            reason,
        };
        if source.ptr().is_null() {
            return Err(copy_failed(format!("source {} has no device memory", source.name())));
        }

        let src_device = source.device();
        let same_device = src_device.device_type() == self.env.device.device_type()
            && src_device.device_id() == self.env.device.device_id();
        if same_device {
            self.env
                .device
                .copy_device_to_device(scratch.ptr(), source.ptr(), size, self.stream_id)
                .map_err(|e| copy_failed(e.to_string()))?;
        } else {
            src_device
                .sync_stream(source.stream_id())
                .map_err(|e| copy_failed(e.to_string()))?;
            let bytes = src_device
                .read_to_host(source.ptr(), size)
                .map_err(|e| copy_failed(e.to_string()))?;
            self.env
                .device
                .write_from_host(scratch.ptr(), &bytes)
                .map_err(|e| copy_failed(e.to_string()))?;
        }

        info!(
            node = %self.name,
            input = slot,
            from = %source.format(),
            to = %expected.format,
            from_device = %source.device_type(),
            size,
            "input copied"
        );
        Ok(scratch)
    }

    fn kernel_tensors(tensors: &[Arc<DeviceTensor>]) -> Vec<KernelTensor> {
        tensors.iter().map(|t| t.kernel_tensor()).collect()
    }

    /// Shape (and type) inference for dynamic nodes; `false` if aborted
    pub fn infer(&self, context: &OpContext) -> RuntimeResult<bool> {
        let mut guard = self.state();
        let state = &mut *guard;
        if self.abort_if_failed(context, state) {
            return Ok(false);
        }
        if self.stage_plan.infer == InferStage::None {
            return Ok(true);
        }

        let started = Instant::now();
        state.phase.advance(ActorPhase::Inferring)?;
        let inputs = Self::kernel_tensors(&state.launch_inputs);
        let outputs = Self::kernel_tensors(&self.outputs);
        let inference_failed = |reason: String| RuntimeError::InferenceFailed {
            node: self.name.clone(),
            reason,
        };

        let inferred: Vec<(Vec<usize>, Option<DType>)> = match self.stage_plan.infer {
            InferStage::InferShapeAndType => state
                .kernel
                .infer_shape_and_type(&inputs, &outputs)
                .map_err(|e| inference_failed(e.to_string()))?
                .into_iter()
                .map(|(shape, dtype)| (shape, Some(dtype)))
                .collect(),
            InferStage::InferShape => state
                .kernel
                .infer_shape(&inputs, &outputs)
                .map_err(|e| inference_failed(e.to_string()))?
                .into_iter()
                .map(|shape| (shape, None))
                .collect(),
            InferStage::None => Vec::new(),
        };
        if inferred.len() != self.outputs.len() {
            return Err(inference_failed(format!(
                "inferred {} outputs, node has {}",
                inferred.len(),
                self.outputs.len()
            )));
        }
        for (output, (shape, dtype)) in self.outputs.iter().zip(inferred) {
            if let Some(dtype) = dtype {
                output.set_dtype(dtype);
            }
            output.set_shape(shape);
        }

        debug!(node = %self.name, shapes = ?self.outputs.iter().map(|o| o.shape()).collect::<Vec<_>>(), "shapes inferred");
        self.env
            .telemetry
            .record_phase(&self.name, ActorPhase::Inferring, started.elapsed());
        Ok(true)
    }

    /// Resize and size refresh for dynamic nodes; `false` if aborted
    pub fn resize(&self, context: &OpContext) -> RuntimeResult<bool> {
        let mut guard = self.state();
        let state = &mut *guard;
        if self.abort_if_failed(context, state) {
            return Ok(false);
        }
        if !self.stage_plan.resize {
            return Ok(true);
        }

        let started = Instant::now();
        state.phase.advance(ActorPhase::Resizing)?;
        let inputs = Self::kernel_tensors(&state.launch_inputs);
        let outputs = Self::kernel_tensors(&self.outputs);
        let status = state.kernel.resize(&inputs, &outputs);
        if status != ResizeStatus::Ok {
            return Err(RuntimeError::ResizeFailed {
                node: self.name.clone(),
                status: status.to_string(),
            });
        }

        let sizes = state.kernel.output_size_list();
        if sizes.len() != self.outputs.len() {
            return Err(RuntimeError::ArityMismatch {
                node: self.name.clone(),
                what: "output size list",
                expected: self.outputs.len(),
                actual: sizes.len(),
            });
        }
        for (index, (output, size)) in self.outputs.iter().zip(sizes).enumerate() {
            if !self.shared_outputs.contains(&index) {
                output.set_size(size);
            }
        }

        let workspace_sizes = state.kernel.workspace_size_list();
        self.update_workspaces(state, &workspace_sizes);

        debug!(node = %self.name, workspaces = state.workspaces.len(), "resized");
        self.env
            .telemetry
            .record_phase(&self.name, ActorPhase::Resizing, started.elapsed());
        Ok(true)
    }

    fn update_workspaces(&self, state: &mut ActorState, sizes: &[usize]) {
        if sizes.len() != state.workspaces.len() {
            debug!(node = %self.name, old = state.workspaces.len(), new = sizes.len(), "workspace count changed");
            state.workspaces.truncate(sizes.len());
            for index in state.workspaces.len()..sizes.len() {
                let workspace = self.make_workspace(index, sizes[index]);
                state.workspaces.push(workspace);
            }
            self.rebuild_workspace_tails(state);
        }
        for (workspace, size) in state.workspaces.iter().zip(sizes) {
            workspace.set_size(*size);
        }
    }

    fn resolve_somas(&self, state: &ActorState) -> RuntimeResult<()> {
        let Some(plan) = &self.env.somas else {
            return Ok(());
        };
        for (index, output) in self.outputs.iter().enumerate() {
            if let Some(offset) = self.output_offset(index) {
                output.set_ptr(plan.device_ptr(offset, output.size())?);
            }
        }
        for (index, workspace) in state.workspaces.iter().enumerate() {
            if let Some(offset) = self.workspace_offset(index) {
                workspace.set_ptr(plan.device_ptr(offset, workspace.size())?);
            }
        }
        Ok(())
    }

    /// Allocate, launch, free and emit outputs; `None` if aborted
    pub fn launch(&self, context: &OpContext) -> RuntimeResult<Option<Vec<Outgoing>>> {
        let mut guard = self.state();
        let state = &mut *guard;
        if self.abort_if_failed(context, state) {
            return Ok(None);
        }
        let telemetry = &self.env.telemetry;
        let memory = self.env.runtime.memory();

        let started = Instant::now();
        state.phase.advance(ActorPhase::MemoryAllocating)?;
        self.resolve_somas(state)?;
        let launch_inputs: Vec<Option<Arc<DeviceTensor>>> =
            state.launch_inputs.iter().cloned().map(Some).collect();
        let alloc_list = memory.manager().adopt_ref_outputs(
            &state.memory_alloc_list,
            &launch_inputs,
            &self.outputs,
            &self.ref_map,
        );
        memory.allocate_memory(&alloc_list, &self.env.device, context, &self.name)?;
        telemetry.record_phase(&self.name, ActorPhase::MemoryAllocating, started.elapsed());

        let started = Instant::now();
        state.phase.advance(ActorPhase::Launching)?;
        let skipped = self.launch_kernel(state)?;
        telemetry.record_launch(&self.name, skipped);
        if self.env.multi_stream {
            self.defer_cross_stream_inputs(state)?;
        }
        if self.shape_kind.is_dynamic_shape() && state.kernel.need_update_output_shape_and_size() {
            self.update_output_shapes(state)?;
        }
        self.write_back_ref_copies(state)?;
        telemetry.record_phase(&self.name, ActorPhase::Launching, started.elapsed());

        let started = Instant::now();
        state.phase.advance(ActorPhase::MemoryFreeing)?;
        memory.free_memory(&state.memory_free_list, context, &self.name)?;
        telemetry.record_phase(&self.name, ActorPhase::MemoryFreeing, started.elapsed());

        state.phase.advance(ActorPhase::OutputSending)?;
        let outgoing = self.outgoing();
        telemetry.record_messages(&self.name, outgoing.len());
        state.phase.advance(ActorPhase::Idle)?;
        state.fetched_inputs.clear();
        state.launch_inputs.clear();

        if let Some(entry) = self.pending().get_mut(&context.sequence()) {
            entry.advance(&self.name, DispatchState::Completed)?;
        }
        debug!(actor = %self.id, node = %self.name, messages = outgoing.len(), "fired");
        Ok(Some(outgoing))
    }

    /// Returns whether the launch was skipped
    fn launch_kernel(&self, state: &ActorState) -> RuntimeResult<bool> {
        let inputs = Self::kernel_tensors(&state.launch_inputs);
        let workspace = Self::kernel_tensors(&state.workspaces);
        let outputs = Self::kernel_tensors(&self.outputs);

        if self.launch_skippable {
            if let (Some(input), Some(output)) = (inputs.first(), outputs.first()) {
                if input.ptr != output.ptr {
                    return Err(RuntimeError::LaunchFailed {
                        node: self.name.clone(),
                        reason: format!(
                            "input and output of skipped-launch node do not alias ({} vs {})",
                            input.ptr, output.ptr
                        ),
                    });
                }
                debug!(node = %self.name, ptr = %input.ptr, "input and output alias, launch skipped");
                return Ok(true);
            }
        }

        let args = LaunchArgs {
            inputs: &inputs,
            workspace: &workspace,
            outputs: &outputs,
        };
        trace!(node = %self.name, kernel = %self.kernel_name, stream = self.stream_id, "launch");
        match self
            .env
            .device
            .launch_kernel(state.kernel.as_ref(), &args, self.stream_id)
        {
            Ok(true) => Ok(false),
            Ok(false) => Err(RuntimeError::LaunchFailed {
                node: self.name.clone(),
                reason: format!("kernel {} reported failure", self.kernel_name),
            }),
            Err(e) => Err(RuntimeError::LaunchFailed {
                node: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Carry in-place results written through an input copy back to the
    /// tensor the copy was made from
    fn write_back_ref_copies(&self, state: &ActorState) -> RuntimeResult<()> {
        let copies = self.env.runtime.copy_store();
        for (output_index, input_index) in &self.ref_map {
            let (Some(output), Some(copy), Some(fetched)) = (
                self.outputs.get(*output_index),
                state.launch_inputs.get(*input_index),
                state.fetched_inputs.get(*input_index),
            ) else {
                continue;
            };
            if Arc::ptr_eq(copy, fetched) || copy.ptr().is_null() || output.ptr() != copy.ptr() {
                continue;
            }
            let Some(source) = copies.fetch(copy)? else {
                continue;
            };
            let size = copy.size().min(source.size());
            if source.ptr().is_null() || size == 0 {
                continue;
            }

            let write_back_failed = |reason: String| RuntimeError::CopyFailed {
                node: self.name.clone(),
                input_index: *input_index,
                reason: format!("write back to {}: {}", source.name(), reason),
            };
            let src_device = source.device();
            let same_device = src_device.device_type() == self.env.device.device_type()
                && src_device.device_id() == self.env.device.device_id();
            if same_device {
                self.env
                    .device
                    .copy_device_to_device(source.ptr(), copy.ptr(), size, self.stream_id)
                    .map_err(|e| write_back_failed(e.to_string()))?;
            } else {
                self.env
                    .device
                    .sync_stream(self.stream_id)
                    .map_err(|e| write_back_failed(e.to_string()))?;
                let bytes = self
                    .env
                    .device
                    .read_to_host(copy.ptr(), size)
                    .map_err(|e| write_back_failed(e.to_string()))?;
                src_device
                    .write_from_host(source.ptr(), &bytes)
                    .map_err(|e| write_back_failed(e.to_string()))?;
            }
            debug!(node = %self.name, input = *input_index, source = source.name(), size, "in-place result written back");
        }
        Ok(())
    }

    /// Hold an extra reference on inputs from other streams until this
    /// actor's stream has passed the launch
    fn defer_cross_stream_inputs(&self, state: &ActorState) -> RuntimeResult<()> {
        let manager = self.env.runtime.memory_manager();
        for input in &state.fetched_inputs {
            if input.stream_id() == self.stream_id || input.is_persistent() || input.ptr().is_null() {
                continue;
            }
            input.increase_ref_count(1);
            self.env.callbacks.increase();

            let counter = Arc::downgrade(&self.env.callbacks);
            let manager = manager.clone();
            let tensor = input.clone();
            let registered = self.env.device.launch_callback(
                self.stream_id,
                Box::new(move || {
                    run_counted(&counter, || {
                        manager.release(&tensor);
                    })
                }),
            );
            if let Err(e) = registered {
                input.decrease_ref_count();
                self.env.callbacks.decrease();
                return Err(e.into());
            }
            trace!(node = %self.name, input = input.name(), from_stream = input.stream_id(), "release deferred to stream");
        }
        Ok(())
    }

    fn update_output_shapes(&self, state: &mut ActorState) -> RuntimeResult<()> {
        self.env.device.sync_stream(self.stream_id)?;
        let inputs = Self::kernel_tensors(&state.launch_inputs);
        let outputs = Self::kernel_tensors(&self.outputs);
        let shapes = state
            .kernel
            .update_output_shape_and_size(&inputs, &outputs)
            .map_err(|e| RuntimeError::InferenceFailed {
                node: self.name.clone(),
                reason: e.to_string(),
            })?;
        for (output, shape) in self.outputs.iter().zip(shapes) {
            output.update_shape(shape);
        }
        Ok(())
    }

    fn outgoing(&self) -> Vec<Outgoing> {
        let data = self.output_data_arrows.iter().map(|arrow| {
            let tensor = self.outputs[arrow.from_output].clone();
            match arrow.target {
                ArrowTarget::Actor { to, slot } => Outgoing::Data {
                    to,
                    data: OpData {
                        tensor,
                        index: slot,
                        from: self.id,
                    },
                },
                ArrowTarget::GraphOutput(position) => Outgoing::Output {
                    position,
                    tensor,
                    from: self.id,
                },
            }
        });
        let control = self.output_control_arrows.iter().map(|to| Outgoing::Control {
            to: *to,
            control: OpControl { from: self.id },
        });
        data.chain(control).collect()
    }

    /// Record `err` on the context and return to Idle
    pub fn fail(&self, context: &OpContext, err: RuntimeError) {
        warn!(actor = %self.id, node = %self.name, error = %err, "firing failed");
        self.env.telemetry.record_failure(&self.name);
        context.set_failed(err);
        self.state().phase.reset();
    }

    /// Fire once for `context` on the calling thread
    pub fn run(&self, context: &OpContext) -> Vec<Outgoing> {
        match self.run_stages(context) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                self.fail(context, e);
                Vec::new()
            }
        }
    }

    fn run_stages(&self, context: &OpContext) -> RuntimeResult<Vec<Outgoing>> {
        if !self.begin(context, None)? || !self.infer(context)? || !self.resize(context)? {
            return Ok(Vec::new());
        }
        Ok(self.launch(context)?.unwrap_or_default())
    }

    /// Return every non-persistent tensor to the device after a failed run
    pub fn reset_after_failure(&self) {
        let manager = self.env.runtime.memory_manager();
        let mut state = self.state();
        state.phase.reset();
        state.fetched_inputs.clear();
        state.launch_inputs.clear();
        for tensor in self.outputs.iter().chain(state.workspaces.iter()) {
            manager.force_release(tensor);
        }
        if let Some(remote) = &self.remote_input {
            manager.force_release(remote);
        }
    }

    /// Release everything the actor owns, including input copies
    pub fn teardown(&self) {
        self.reset_after_failure();
        let manager = self.env.runtime.memory_manager();
        let state = self.state();
        let copies = self.env.runtime.copy_store();
        for copy in state.copy_slots.iter().flatten() {
            manager.force_release(copy);
            if let Err(e) = copies.remove(copy) {
                warn!(node = %self.name, copy = copy.name(), error = %e, "copy store cleanup failed");
            }
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> &ActorVariant {
        &self.variant
    }

    pub fn shape_kind(&self) -> ShapeKind {
        self.shape_kind
    }

    pub fn stage_plan(&self) -> StagePlan {
        self.stage_plan
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn device(&self) -> &Arc<dyn DeviceContext> {
        &self.env.device
    }

    pub fn inputs(&self) -> &[InputSource] {
        &self.inputs
    }

    pub fn dependencies(&self) -> usize {
        self.dependency_count()
    }

    /// Nodes this actor waits on through control arrows
    pub fn control_dependencies(&self) -> &[NodeId] {
        &self.control_deps
    }

    pub fn phase(&self) -> ActorPhase {
        self.state().phase.phase()
    }

    pub fn output_tensors(&self) -> &[Arc<DeviceTensor>] {
        &self.outputs
    }

    pub fn remote_input(&self) -> Option<&Arc<DeviceTensor>> {
        self.remote_input.as_ref()
    }

    pub fn memory_alloc_list(&self) -> Vec<Arc<DeviceTensor>> {
        self.state().memory_alloc_list.clone()
    }

    pub fn memory_free_list(&self) -> Vec<Arc<DeviceTensor>> {
        self.state().memory_free_list.clone()
    }

    pub fn workspaces(&self) -> Vec<Arc<DeviceTensor>> {
        self.state().workspaces.clone()
    }

    /// Scratch tensor of input `slot`, once a copy was needed
    pub fn input_copy(&self, slot: usize) -> Option<Arc<DeviceTensor>> {
        self.state().copy_slots.get(slot).cloned().flatten()
    }

    /// Sender of the remote message consumed by the last firing
    pub fn from_actor(&self) -> Option<String> {
        self.remote().from_actor.clone()
    }
}

impl std::fmt::Debug for KernelActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelActor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kernel", &self.kernel_name)
            .field("variant", &self.variant)
            .field("shape_kind", &self.shape_kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::kernel::{DType, KernelResult};
    use crate::scheduler::SchedulerConfig;

    /// Copies input 0 to output 0, reporting `out_len` elements after resize
    struct Passthrough {
        out_len: usize,
        workspaces: Vec<usize>,
    }

    impl KernelMod for Passthrough {
        fn name(&self) -> &str {
            "Passthrough"
        }
        fn infer_shape(&self, inputs: &[KernelTensor], _: &[KernelTensor]) -> KernelResult<Vec<Vec<usize>>> {
            Ok(vec![inputs[0].shape.clone()])
        }
        fn resize(&mut self, inputs: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
            self.out_len = inputs[0].element_count();
            self.workspaces = vec![16; self.out_len / 4];
            ResizeStatus::Ok
        }
        fn launch(&self, args: &LaunchArgs<'_>, stream: StreamId, device: &dyn DeviceContext) -> bool {
            device
                .copy_device_to_device(args.outputs[0].ptr, args.inputs[0].ptr, args.outputs[0].size, stream)
                .is_ok()
        }
        fn output_size_list(&self) -> Vec<usize> {
            vec![self.out_len * 4]
        }
        fn workspace_size_list(&self) -> Vec<usize> {
            self.workspaces.clone()
        }
    }

    fn info(n: usize) -> TensorInfo {
        TensorInfo::new(vec![n], DType::F32)
    }

    fn env(device: Arc<HostDevice>) -> ActorEnv {
        ActorEnv {
            runtime: RuntimeContext::new(SchedulerConfig::default()).unwrap(),
            device,
            somas: None,
            telemetry: Arc::new(Telemetry::new()),
            callbacks: CallbackCounter::new(),
            multi_stream: false,
        }
    }

    fn actor(kind: ShapeKind, device: &Arc<HostDevice>) -> KernelActor {
        let node = GraphNode::new("copy", Box::new(Passthrough { out_len: 4, workspaces: vec![16] }))
            .with_input(InputSource::GraphInput(0), info(4))
            .with_output(info(4))
            .with_shape_kind(kind);
        let output = Arc::new(DeviceTensor::new("copy:0", &info(4), device.clone(), 0));
        let wiring = ActorWiring {
            outputs: vec![output],
            ..ActorWiring::default()
        };
        let actor = KernelActor::new(ActorId(0), node, wiring, env(device.clone()));
        actor.init().unwrap();
        actor
    }

    fn input(device: &Arc<HostDevice>, values: &[f32]) -> Arc<DeviceTensor> {
        let t = Arc::new(DeviceTensor::new("x", &info(values.len()), device.clone(), 0));
        t.set_ptr(device.allocate(values.len() * 4).unwrap());
        device
            .write_from_host(t.ptr(), &crate::kernel::f32_to_bytes(values))
            .unwrap();
        t
    }

    #[test]
    fn test_init_builds_lists() {
        let device = Arc::new(HostDevice::new(0));
        let actor = actor(ShapeKind::STATIC, &device);
        assert_eq!(actor.memory_alloc_list().len(), 2);
        assert_eq!(actor.memory_free_list().len(), 2);
        assert_eq!(actor.workspaces().len(), 1);
        assert_eq!(actor.dependencies(), 1);
    }

    #[test]
    fn test_fire_static_node() {
        let device = Arc::new(HostDevice::new(0));
        let actor = actor(ShapeKind::STATIC, &device);
        let ctx = OpContext::new(1);
        let x = input(&device, &[1.0, 2.0, 3.0, 4.0]);

        let runnable = actor
            .receive_data(&ctx, OpData { tensor: x.clone(), index: 0, from: ActorId(9) })
            .unwrap();
        assert!(runnable);
        assert_eq!(actor.dispatch_state(1), Some(DispatchState::Runnable));

        let outgoing = actor.run(&ctx);
        assert!(outgoing.is_empty());
        assert!(!ctx.is_failed());
        assert_eq!(actor.dispatch_state(1), Some(DispatchState::Completed));
        // input released by the consumer, output and workspace by the producer
        assert!(x.ptr().is_null());
        assert!(actor.output_tensors()[0].ptr().is_null());
        assert_eq!(device.stats().live_allocations, 0);
        assert_eq!(actor.memory_free_list().len(), 3);

        actor.clear_context(1);
        assert_eq!(actor.dispatch_state(1), None);
    }

    #[test]
    fn test_dynamic_node_grows_workspaces() {
        let device = Arc::new(HostDevice::new(0));
        let actor = actor(ShapeKind::DYNAMIC_SHAPE, &device);
        let ctx = OpContext::new(1);
        let x = input(&device, &[0.0; 8]);

        actor
            .receive_data(&ctx, OpData { tensor: x, index: 0, from: ActorId(9) })
            .unwrap();
        assert!(actor.begin(&ctx, None).unwrap());
        assert!(actor.infer(&ctx).unwrap());
        assert!(actor.resize(&ctx).unwrap());

        assert_eq!(actor.output_tensors()[0].shape(), vec![8]);
        assert_eq!(actor.output_tensors()[0].size(), 32);
        assert_eq!(actor.workspaces().len(), 2);
        // input head + output + two workspaces
        assert_eq!(actor.memory_free_list().len(), 4);
        assert_eq!(actor.memory_alloc_list().len(), 3);

        assert!(actor.launch(&ctx).unwrap().is_some());
        assert_eq!(device.stats().live_allocations, 0);
    }

    #[test]
    fn test_duplicate_data_rejected() {
        let device = Arc::new(HostDevice::new(0));
        let actor = actor(ShapeKind::STATIC, &device);
        let ctx = OpContext::new(1);
        let x = input(&device, &[1.0; 4]);
        let data = OpData { tensor: x, index: 0, from: ActorId(9) };
        actor.receive_data(&ctx, data.clone()).unwrap();
        assert!(actor.receive_data(&ctx, data).unwrap_err().is_internal_error());
    }

    #[test]
    fn test_failed_context_aborts_firing() {
        let device = Arc::new(HostDevice::new(0));
        let actor = actor(ShapeKind::STATIC, &device);
        let ctx = OpContext::new(1);
        let x = input(&device, &[1.0; 4]);
        actor
            .receive_data(&ctx, OpData { tensor: x, index: 0, from: ActorId(9) })
            .unwrap();
        ctx.set_failed(RuntimeError::InternalError("upstream".into()));

        assert!(actor.run(&ctx).is_empty());
        assert_eq!(device.stats().launch_count, 0);
        assert_eq!(actor.phase(), ActorPhase::Idle);
    }

    #[test]
    fn test_remote_slot_on_compute_actor_rejected() {
        let device = Arc::new(HostDevice::new(0));
        let node = GraphNode::new("bad", Box::new(Passthrough { out_len: 4, workspaces: vec![] }))
            .with_input(InputSource::Remote, info(4))
            .with_output(info(4));
        let output = Arc::new(DeviceTensor::new("bad:0", &info(4), device.clone(), 0));
        let actor = KernelActor::new(
            ActorId(0),
            node,
            ActorWiring { outputs: vec![output], ..ActorWiring::default() },
            env(device),
        );
        assert!(actor.init().unwrap_err().is_configuration_error());
    }
}

//! Graph scheduler
//!
//! Turns a compiled [`KernelGraph`] into a set of wired kernel actors and
//! drives one run at a time: upload graph inputs, kick off actors without
//! dependencies, wait until every task of the op context has drained, then
//! hand the graph outputs (or the first error) back to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use super::dispatcher::{ActorDirectory, Dispatcher, RunHandle};
use super::telemetry::{ExecutionSummary, Telemetry};
use crate::actor::{
    ActorEnv, ActorId, ActorWiring, ArrowTarget, CallbackCounter, KernelActor, OpContext, OpData,
    Outgoing, RemoteDelivery, RemoteMessage,
};
use crate::context::RuntimeContext;
use crate::device::DeviceContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{GraphNode, InputSource, KernelGraph};
use crate::kernel::{HostTensor, TensorInfo};
use crate::memory::{DeviceTensor, SomasPlan, PERSISTENT_REF_COUNT};

/// Upper bound on waiting for stream callbacks at the end of a run
const CALLBACK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct GraphInputSlot {
    info: TensorInfo,
    tensor: Arc<DeviceTensor>,
    consumers: Vec<(ActorId, usize)>,
}

pub struct GraphScheduler {
    runtime: Arc<RuntimeContext>,
    devices: Vec<Arc<dyn DeviceContext>>,
    dispatcher: Arc<Dispatcher>,
    telemetry: Arc<Telemetry>,
    callbacks: Arc<CallbackCounter>,
    somas: Option<Arc<SomasPlan>>,
    inputs: Vec<GraphInputSlot>,
    parameters: HashMap<String, Arc<DeviceTensor>>,
    output_count: usize,
    multi_stream: bool,
    sequence: AtomicU64,
    run_lock: Mutex<()>,
    active: Mutex<Option<Arc<RunHandle>>>,
}

impl GraphScheduler {
    /// Build and initialize one actor per node
    ///
    /// `devices[i]` serves every node, input and parameter with
    /// `device_index == i`. Contract violations between the graph and the
    /// kernels are reported here, before any run.
    pub fn build(
        graph: KernelGraph,
        devices: Vec<Arc<dyn DeviceContext>>,
        runtime: Arc<RuntimeContext>,
    ) -> RuntimeResult<Self> {
        graph.validate()?;
        check_devices(&graph, devices.len())?;

        let config = runtime.config().clone();
        let multi_stream = config
            .multi_stream
            .unwrap_or_else(|| graph.stream_ids().len() > 1);
        let somas = match graph.somas_plan() {
            Some(info) if config.enable_somas => Some(Arc::new(SomasPlan::allocate(
                info,
                devices[info.device_index()].clone(),
            )?)),
            Some(_) => {
                debug!("static memory plan disabled by configuration");
                None
            }
            None => None,
        };
        let telemetry = Arc::new(Telemetry::new());
        let callbacks = CallbackCounter::new();

        let (nodes, graph_inputs, graph_parameters, graph_outputs, _) = graph.into_parts();
        let mut inputs: Vec<GraphInputSlot> = graph_inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| GraphInputSlot {
                tensor: Arc::new(DeviceTensor::new(
                    format!("input{}", index),
                    &input.info,
                    devices[input.device_index].clone(),
                    0,
                )),
                info: input.info,
                consumers: Vec::new(),
            })
            .collect();

        let store = runtime.tensor_store();
        let mut parameters = HashMap::with_capacity(graph_parameters.len());
        for parameter in graph_parameters {
            let tensor = Arc::new(DeviceTensor::new(
                parameter.key.clone(),
                &parameter.info,
                devices[parameter.device_index].clone(),
                0,
            ));
            tensor.set_original_ref_count(PERSISTENT_REF_COUNT);
            store.insert(&parameter.key, tensor.clone())?;
            parameters.insert(parameter.key, tensor);
        }

        let mut actors: Vec<KernelActor> = Vec::with_capacity(nodes.len());
        for (index, node) in nodes.into_iter().enumerate() {
            let device = devices[node.device_index].clone();
            let wiring = wire_node(&node, &device, &actors, &inputs, &parameters);
            let env = ActorEnv {
                runtime: runtime.clone(),
                device,
                somas: somas.clone(),
                telemetry: telemetry.clone(),
                callbacks: callbacks.clone(),
                multi_stream,
            };
            actors.push(KernelActor::new(ActorId(index), node, wiring, env));
        }

        // Arrows follow the consumers' input lists
        let mut data_arrows = Vec::new();
        for (index, actor) in actors.iter().enumerate() {
            for (slot, source) in actor.inputs().iter().enumerate() {
                match source {
                    InputSource::Node { node, output } => {
                        data_arrows.push((*node, *output, ArrowTarget::Actor { to: ActorId(index), slot }))
                    }
                    InputSource::GraphInput(input) => {
                        inputs[*input].consumers.push((ActorId(index), slot))
                    }
                    InputSource::Parameter(_) | InputSource::Remote => {}
                }
            }
        }
        for (position, (node, output)) in graph_outputs.iter().enumerate() {
            data_arrows.push((*node, *output, ArrowTarget::GraphOutput(position)));
        }
        for (producer, output, target) in data_arrows {
            actors[producer].add_output_arrow(output, target)?;
        }
        let control_arrows: Vec<(usize, ActorId)> = actors
            .iter()
            .flat_map(|actor| actor.control_dependencies().iter().map(|dep| (*dep, actor.id())))
            .collect();
        for (producer, to) in control_arrows {
            actors[producer].add_control_arrow(to);
        }

        for actor in &actors {
            actor.init()?;
        }
        set_ref_counts(&actors, &inputs, &graph_outputs);

        let actors: Vec<Arc<KernelActor>> = actors.into_iter().map(Arc::new).collect();
        let directory = Arc::new(ActorDirectory::new(actors)?);
        let dispatcher = Dispatcher::new(directory, &config, runtime.memory_manager().clone())?;

        info!(
            actors = dispatcher.directory().len(),
            inputs = inputs.len(),
            parameters = parameters.len(),
            outputs = graph_outputs.len(),
            multi_stream,
            somas = somas.is_some(),
            mode = ?config.execution_mode,
            "graph scheduler built"
        );

        Ok(GraphScheduler {
            runtime,
            devices,
            dispatcher,
            telemetry,
            callbacks,
            somas,
            inputs,
            parameters,
            output_count: graph_outputs.len(),
            multi_stream,
            sequence: AtomicU64::new(0),
            run_lock: Mutex::new(()),
            active: Mutex::new(None),
        })
    }

    fn active(&self) -> MutexGuard<'_, Option<Arc<RunHandle>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn directory(&self) -> &ActorDirectory {
        self.dispatcher.directory()
    }

    /// Upload `value` into the persistent tensor `key`
    ///
    /// Binding waits for any run in progress.
    pub fn bind_parameter(&self, key: &str, value: &HostTensor) -> RuntimeResult<()> {
        let _serial = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let tensor = self
            .parameters
            .get(key)
            .ok_or_else(|| RuntimeError::ParameterNotBound(key.to_string()))?;
        if value.data.len() != value.info.byte_size() {
            return Err(RuntimeError::InvalidInput {
                index: 0,
                reason: format!(
                    "parameter {} holds {} bytes for shape {:?}",
                    key,
                    value.data.len(),
                    value.info.shape
                ),
            });
        }

        let size = value.data.len();
        if !tensor.ptr().is_null() && tensor.size() != size {
            self.runtime.memory_manager().release_persistent(tensor);
        }
        tensor.set_shape(value.info.shape.clone());
        tensor.set_dtype(value.info.dtype);
        tensor.set_size(size);
        if tensor.ptr().is_null() {
            tensor.set_ptr(tensor.device().allocate(size)?);
        }
        if size > 0 {
            tensor.device().write_from_host(tensor.ptr(), &value.data)?;
        }
        info!(key, bytes = size, "parameter bound");
        Ok(())
    }

    /// Execute the graph once and return its outputs in graph order
    pub fn run(&self, inputs: &[HostTensor]) -> RuntimeResult<Vec<HostTensor>> {
        let _serial = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_inputs(inputs)?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let span = info_span!("run", sequence);
        let _enter = span.enter();
        let started = Instant::now();

        let ctx = Arc::new(OpContext::new(sequence));
        let awaiting_remote = self
            .directory()
            .iter()
            .filter(|actor| actor.variant().receives_remote())
            .count();
        let run = Arc::new(RunHandle::new(ctx.clone(), self.output_count, awaiting_remote));
        debug!(inputs = inputs.len(), awaiting_remote, "run started");

        // Held until every initial message is out, so the run cannot look
        // finished before it started
        let kickoff = ctx.begin_task();
        {
            let mut active = self.active();
            *active = Some(run.clone());
            for actor in self.directory().iter() {
                if let Some(message) = actor.next_queued_remote() {
                    if let Err(e) = self.deliver_remote(&run, actor, message) {
                        ctx.set_failed(e);
                    }
                }
            }
        }
        if let Err(e) = self.send_inputs(&run, inputs) {
            ctx.set_failed(e);
        }
        for actor in self.directory().iter().filter(|a| a.dependencies() == 0) {
            match actor.mark_runnable(&ctx) {
                Ok(true) => self.dispatcher.spawn(&run, actor.id()),
                Ok(false) => {}
                Err(e) => ctx.set_failed(e),
            }
        }
        drop(kickoff);

        self.wait_for_run(&run);
        self.finish_run(&run);

        let elapsed = started.elapsed();
        let result = match ctx.error() {
            None => run.collector.take_outputs(),
            Some(e) => Err(e),
        };
        self.telemetry.record_run(result.is_ok(), elapsed);
        match &result {
            Ok(outputs) => info!(
                outputs = outputs.len(),
                elapsed_us = elapsed.as_micros() as u64,
                "run completed"
            ),
            Err(e) => error!(
                category = %e.category(),
                elapsed_us = elapsed.as_micros() as u64,
                "run failed: {}",
                e
            ),
        }
        result
    }

    /// [`GraphScheduler::run`] on the blocking thread pool
    pub async fn run_async(self: &Arc<Self>, inputs: Vec<HostTensor>) -> RuntimeResult<Vec<HostTensor>> {
        let scheduler = self.clone();
        tokio::task::spawn_blocking(move || scheduler.run(&inputs))
            .await
            .map_err(|e| RuntimeError::InternalError(format!("run task failed: {}", e)))?
    }

    fn check_inputs(&self, inputs: &[HostTensor]) -> RuntimeResult<()> {
        if inputs.len() != self.inputs.len() {
            return Err(RuntimeError::InvalidInput {
                index: inputs.len().min(self.inputs.len()),
                reason: format!(
                    "graph takes {} inputs, {} given",
                    self.inputs.len(),
                    inputs.len()
                ),
            });
        }
        for (index, (host, slot)) in inputs.iter().zip(&self.inputs).enumerate() {
            if host.info.dtype != slot.info.dtype {
                return Err(RuntimeError::InvalidInput {
                    index,
                    reason: format!("expected {:?}, got {:?}", slot.info.dtype, host.info.dtype),
                });
            }
            if host.data.len() != host.info.byte_size() {
                return Err(RuntimeError::InvalidInput {
                    index,
                    reason: format!(
                        "{} bytes do not fill shape {:?}",
                        host.data.len(),
                        host.info.shape
                    ),
                });
            }
        }
        Ok(())
    }

    /// Upload graph inputs and send them to their consumers
    fn send_inputs(&self, run: &Arc<RunHandle>, inputs: &[HostTensor]) -> RuntimeResult<()> {
        let memory = self.runtime.memory();
        for (host, slot) in inputs.iter().zip(&self.inputs) {
            let tensor = &slot.tensor;
            tensor.set_shape(host.info.shape.clone());
            tensor.set_dtype(host.info.dtype);
            tensor.set_size(host.data.len());
            memory.allocate_memory(
                std::slice::from_ref(tensor),
                tensor.device(),
                &run.ctx,
                "graph input",
            )?;
            if !host.data.is_empty() {
                tensor.device().write_from_host(tensor.ptr(), &host.data)?;
            }
        }

        for slot in &self.inputs {
            let outgoing = slot
                .consumers
                .iter()
                .map(|(to, index)| Outgoing::Data {
                    to: *to,
                    data: OpData {
                        tensor: slot.tensor.clone(),
                        index: *index,
                        from: ActorId::SOURCE,
                    },
                })
                .collect();
            self.dispatcher.deliver(run, outgoing);
            // the scheduler's own reference
            self.runtime.memory_manager().release(&slot.tensor);
        }
        Ok(())
    }

    fn wait_for_run(&self, run: &RunHandle) {
        let ctx = &run.ctx;
        let timeout = self.runtime.config().run_timeout;
        let mut deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let settled = ctx.wait_until(deadline, |in_flight| {
                in_flight == 0
                    && (ctx.is_failed()
                        || run.collector.is_complete()
                        || run.awaiting_remote() == 0)
            });
            if !settled {
                let millis = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                warn!(millis, in_flight = ctx.in_flight(), "run timed out");
                ctx.set_failed(RuntimeError::RunTimeout {
                    sequence: ctx.sequence(),
                    millis,
                });
                deadline = None;
                continue;
            }
            // Remote posts start tasks under the active lock
            let mut active = self.active();
            if ctx.in_flight() == 0 {
                *active = None;
                break;
            }
        }

        if !ctx.is_failed() && !run.collector.is_complete() {
            ctx.set_failed(RuntimeError::RunStalled {
                sequence: ctx.sequence(),
                received: run.collector.received(),
                expected: run.collector.expected(),
            });
        }
    }

    fn finish_run(&self, run: &RunHandle) {
        let ctx = &run.ctx;
        for device in &self.devices {
            if let Err(e) = device.sync_all_streams() {
                ctx.set_failed(e.into());
            }
        }
        if !self.callbacks.wait_drained(Some(CALLBACK_WAIT)) {
            warn!(pending = self.callbacks.count(), "stream callbacks still pending after run");
        }

        for actor in self.directory().iter() {
            actor.clear_context(ctx.sequence());
        }
        if ctx.is_failed() {
            self.recover();
        }
    }

    /// Return every run-scoped tensor to the device and restore counts
    fn recover(&self) {
        debug!("releasing memory of failed run");
        let manager = self.runtime.memory_manager();
        for actor in self.directory().iter() {
            actor.reset_after_failure();
        }
        for slot in &self.inputs {
            manager.force_release(&slot.tensor);
        }
    }

    /// Post a remote message to the receive actor `node`
    ///
    /// Delivered to the run in progress, or kept until the next run starts.
    pub fn post_remote(
        &self,
        node: &str,
        from: &str,
        payload: HostTensor,
    ) -> RuntimeResult<RemoteDelivery> {
        let actor = self
            .directory()
            .lookup(node)
            .ok_or_else(|| RuntimeError::ActorNotFound(node.to_string()))?;
        if !actor.variant().receives_remote() {
            return Err(RuntimeError::MessageRejected {
                actor: node.to_string(),
                from: from.to_string(),
                reason: "not a receive actor".to_string(),
            });
        }
        let message = RemoteMessage {
            from: from.to_string(),
            payload,
        };

        let active = self.active();
        match active.as_ref() {
            Some(run) => self.deliver_remote(run, actor, message),
            None => {
                actor.queue_remote(message)?;
                Ok(RemoteDelivery::Queued)
            }
        }
    }

    fn deliver_remote(
        &self,
        run: &Arc<RunHandle>,
        actor: &Arc<KernelActor>,
        message: RemoteMessage,
    ) -> RuntimeResult<RemoteDelivery> {
        let _delivering = run.ctx.begin_task();
        let delivery = actor.receive_remote(&run.ctx, message)?;
        if let RemoteDelivery::Accepted { runnable } = delivery {
            run.remote_arrived();
            if runnable {
                self.dispatcher.spawn(run, actor.id());
            }
        }
        Ok(delivery)
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn summary(&self) -> ExecutionSummary {
        self.telemetry.summary()
    }

    pub fn actor(&self, name: &str) -> Option<&Arc<KernelActor>> {
        self.directory().lookup(name)
    }

    pub fn actors(&self) -> impl Iterator<Item = &Arc<KernelActor>> {
        self.directory().iter()
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    pub fn multi_stream_enabled(&self) -> bool {
        self.multi_stream
    }

    pub fn graph_input_tensor(&self, index: usize) -> Option<&Arc<DeviceTensor>> {
        self.inputs.get(index).map(|slot| &slot.tensor)
    }

    pub fn parameter(&self, key: &str) -> Option<&Arc<DeviceTensor>> {
        self.parameters.get(key)
    }

    pub fn somas_plan(&self) -> Option<&Arc<SomasPlan>> {
        self.somas.as_ref()
    }

    /// Runs started so far
    pub fn runs(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Drop for GraphScheduler {
    fn drop(&mut self) {
        for device in &self.devices {
            if let Err(e) = device.sync_all_streams() {
                warn!(device = device.device_id(), error = %e, "stream sync failed at teardown");
            }
        }
        if !self.callbacks.wait_drained(Some(CALLBACK_WAIT)) {
            warn!(pending = self.callbacks.count(), "tearing down with pending stream callbacks");
        }

        let manager = self.runtime.memory_manager();
        for actor in self.directory().iter() {
            actor.teardown();
        }
        for slot in &self.inputs {
            manager.force_release(&slot.tensor);
        }
        match self.runtime.tensor_store().drain() {
            Ok(tensors) => {
                for tensor in tensors {
                    manager.release_persistent(&tensor);
                }
            }
            Err(e) => warn!(error = %e, "tensor store drain failed at teardown"),
        }
        debug!(runs = self.runs(), "graph scheduler dropped");
    }
}

impl std::fmt::Debug for GraphScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphScheduler")
            .field("actors", &self.directory().len())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.output_count)
            .field("multi_stream", &self.multi_stream)
            .field("runs", &self.runs())
            .finish()
    }
}

fn check_devices(graph: &KernelGraph, available: usize) -> RuntimeResult<()> {
    let mismatch = |node: String, index: usize| RuntimeError::DeviceContextMismatch {
        node,
        index,
        available,
    };
    for node in graph.nodes() {
        if node.device_index >= available {
            return Err(mismatch(node.name.clone(), node.device_index));
        }
    }
    for (index, input) in graph.inputs().iter().enumerate() {
        if input.device_index >= available {
            return Err(mismatch(format!("graph input {}", index), input.device_index));
        }
    }
    for parameter in graph.parameters() {
        if parameter.device_index >= available {
            return Err(mismatch(format!("parameter {}", parameter.key), parameter.device_index));
        }
    }
    if let Some(plan) = graph.somas_plan() {
        if plan.device_index() >= available {
            return Err(mismatch("static memory plan".to_string(), plan.device_index()));
        }
    }
    Ok(())
}

/// Create the node's output tensors, sharing in-place outputs with their input
fn wire_node(
    node: &GraphNode,
    device: &Arc<dyn DeviceContext>,
    built: &[KernelActor],
    inputs: &[GraphInputSlot],
    parameters: &HashMap<String, Arc<DeviceTensor>>,
) -> ActorWiring {
    let remote_input = match (node.variant.receives_remote(), node.inputs.first()) {
        (true, Some(InputSource::Remote)) => Some(Arc::new(DeviceTensor::new(
            format!("{}:remote", node.name),
            &node.input_infos[0],
            device.clone(),
            node.stream_id,
        ))),
        _ => None,
    };

    let mut wiring = ActorWiring {
        remote_input,
        ..ActorWiring::default()
    };
    for (index, info) in node.outputs.iter().enumerate() {
        let shared = node.ref_input_of(index).and_then(|slot| {
            let source = match &node.inputs[slot] {
                InputSource::Node { node, output } => built[*node].output_tensors()[*output].clone(),
                InputSource::GraphInput(input) => inputs[*input].tensor.clone(),
                InputSource::Parameter(key) => parameters.get(key)?.clone(),
                InputSource::Remote => wiring.remote_input.clone()?,
            };
            let compatible = source.device_type() == device.device_type()
                && source.format().is_equivalent(&node.input_infos[slot].format)
                && info.format.is_equivalent(&source.format());
            compatible.then_some(source)
        });
        match shared {
            Some(source) => {
                debug!(node = %node.name, output = index, tensor = source.name(), "output shares its ref input");
                wiring.shared_outputs.insert(index);
                wiring.outputs.push(source);
            }
            None => wiring.outputs.push(Arc::new(DeviceTensor::new(
                format!("{}:{}", node.name, index),
                info,
                device.clone(),
                node.stream_id,
            ))),
        }
    }
    wiring
}

/// Original count of every counted tensor: one release by its owner plus
/// one per consuming input slot and graph output
fn set_ref_counts(
    actors: &[KernelActor],
    inputs: &[GraphInputSlot],
    graph_outputs: &[(usize, usize)],
) {
    let mut tensors: HashMap<u64, (Arc<DeviceTensor>, usize)> = HashMap::new();
    let mut count = |tensor: &Arc<DeviceTensor>, consumers: usize| {
        tensors
            .entry(tensor.id())
            .or_insert_with(|| (tensor.clone(), 0))
            .1 += consumers;
    };

    for slot in inputs {
        count(&slot.tensor, 0);
    }
    for actor in actors {
        if let Some(remote) = actor.remote_input() {
            count(remote, 0);
        }
        for output in actor.output_tensors() {
            count(output, 0);
        }
        for source in actor.inputs() {
            match source {
                InputSource::Node { node, output } => {
                    count(&actors[*node].output_tensors()[*output], 1)
                }
                InputSource::GraphInput(input) => count(&inputs[*input].tensor, 1),
                InputSource::Parameter(_) | InputSource::Remote => {}
            }
        }
    }
    for (node, output) in graph_outputs {
        count(&actors[*node].output_tensors()[*output], 1);
    }

    for (tensor, consumers) in tensors.into_values() {
        if tensor.is_persistent() {
            continue;
        }
        tensor.set_original_ref_count(1 + consumers);
    }
}

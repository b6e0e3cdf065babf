//! Compiled kernel graph
//!
//! The graph compiler hands the scheduler a topologically ordered list of
//! [`GraphNode`]s. Node inputs may only refer to earlier nodes, so node order
//! is a valid execution order. The scheduler consumes the graph at build time;
//! nothing about its structure changes afterwards.

use std::collections::HashSet;
use std::fmt;

use crate::actor::ActorVariant;
use crate::device::StreamId;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::{KernelMod, ShapeKind, TensorInfo};
use crate::memory::SomasInfo;

pub type NodeId = usize;

/// Where a node input comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputSource {
    /// Output `output` of an earlier node
    Node { node: NodeId, output: usize },
    /// Graph input uploaded at the start of every run
    GraphInput(usize),
    /// Persistent tensor bound once into the device tensor store
    Parameter(String),
    /// Payload delivered by a remote sender to a receive actor
    Remote,
}

/// Offsets of a node's tensors inside the static memory plan
///
/// `None` entries are allocated dynamically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SomasPlacement {
    pub outputs: Vec<Option<usize>>,
    pub workspaces: Vec<Option<usize>>,
}

impl SomasPlacement {
    pub fn is_empty(&self) -> bool {
        self.outputs.iter().chain(self.workspaces.iter()).all(Option::is_none)
    }
}

/// Graph input declaration
#[derive(Debug, Clone)]
pub struct GraphInput {
    pub info: TensorInfo,
    pub device_index: usize,
}

/// Persistent operand declaration (weights)
#[derive(Debug, Clone)]
pub struct GraphParameter {
    pub key: String,
    pub info: TensorInfo,
    pub device_index: usize,
}

/// One compiled node
pub struct GraphNode {
    pub name: String,
    pub kernel: Box<dyn KernelMod>,
    pub inputs: Vec<InputSource>,
    /// Expected descriptor per input (format, shape, type)
    pub input_infos: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub shape_kind: ShapeKind,
    /// In-place pairs `(output_index, input_index)`
    pub ref_map: Vec<(usize, usize)>,
    pub stream_id: StreamId,
    pub device_index: usize,
    pub somas: Option<SomasPlacement>,
    pub control_deps: Vec<NodeId>,
    pub variant: ActorVariant,
    /// Launch may be skipped when input 0 and output 0 already alias
    pub launch_skippable: bool,
    /// Kernel requires its inputs in one continuous block
    pub continuous_inputs: bool,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, kernel: Box<dyn KernelMod>) -> Self {
        GraphNode {
            name: name.into(),
            kernel,
            inputs: Vec::new(),
            input_infos: Vec::new(),
            outputs: Vec::new(),
            shape_kind: ShapeKind::STATIC,
            ref_map: Vec::new(),
            stream_id: 0,
            device_index: 0,
            somas: None,
            control_deps: Vec::new(),
            variant: ActorVariant::Compute,
            launch_skippable: false,
            continuous_inputs: false,
        }
    }

    pub fn with_input(mut self, source: InputSource, info: TensorInfo) -> Self {
        self.inputs.push(source);
        self.input_infos.push(info);
        self
    }

    pub fn with_output(mut self, info: TensorInfo) -> Self {
        self.outputs.push(info);
        self
    }

    pub fn with_shape_kind(mut self, kind: ShapeKind) -> Self {
        self.shape_kind = kind;
        self
    }

    pub fn with_ref(mut self, output: usize, input: usize) -> Self {
        self.ref_map.push((output, input));
        self
    }

    pub fn on_stream(mut self, stream: StreamId) -> Self {
        self.stream_id = stream;
        self
    }

    pub fn on_device(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    pub fn with_somas(mut self, placement: SomasPlacement) -> Self {
        self.somas = Some(placement);
        self
    }

    pub fn after(mut self, node: NodeId) -> Self {
        self.control_deps.push(node);
        self
    }

    pub fn with_variant(mut self, variant: ActorVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn launch_skippable(mut self) -> Self {
        self.launch_skippable = true;
        self
    }

    pub fn with_continuous_inputs(mut self) -> Self {
        self.continuous_inputs = true;
        self
    }

    /// Input that output `output` aliases in place, if any
    pub fn ref_input_of(&self, output: usize) -> Option<usize> {
        self.ref_map
            .iter()
            .find(|(out, _)| *out == output)
            .map(|(_, input)| *input)
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("name", &self.name)
            .field("kernel", &self.kernel.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs.len())
            .field("shape_kind", &self.shape_kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Topologically ordered kernel graph
#[derive(Debug, Default)]
pub struct KernelGraph {
    nodes: Vec<GraphNode>,
    inputs: Vec<GraphInput>,
    parameters: Vec<GraphParameter>,
    outputs: Vec<(NodeId, usize)>,
    somas: Option<SomasInfo>,
}

impl KernelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a graph input on device 0
    pub fn add_input(&mut self, info: TensorInfo) -> usize {
        self.add_input_on(info, 0)
    }

    pub fn add_input_on(&mut self, info: TensorInfo, device_index: usize) -> usize {
        self.inputs.push(GraphInput { info, device_index });
        self.inputs.len() - 1
    }

    pub fn add_parameter(&mut self, key: impl Into<String>, info: TensorInfo) {
        self.parameters.push(GraphParameter {
            key: key.into(),
            info,
            device_index: 0,
        });
    }

    pub fn add_node(&mut self, node: GraphNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn mark_output(&mut self, node: NodeId, output: usize) -> usize {
        self.outputs.push((node, output));
        self.outputs.len() - 1
    }

    pub fn set_somas_plan(&mut self, plan: SomasInfo) {
        self.somas = Some(plan);
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[GraphInput] {
        &self.inputs
    }

    pub fn parameters(&self) -> &[GraphParameter] {
        &self.parameters
    }

    pub fn outputs(&self) -> &[(NodeId, usize)] {
        &self.outputs
    }

    pub fn somas_plan(&self) -> Option<&SomasInfo> {
        self.somas.as_ref()
    }

    /// Distinct streams used by the nodes
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.nodes.iter().map(|n| n.stream_id).collect();
        streams.sort_unstable();
        streams.dedup();
        streams
    }

    /// Take the graph apart for the scheduler
    pub(crate) fn into_parts(
        self,
    ) -> (
        Vec<GraphNode>,
        Vec<GraphInput>,
        Vec<GraphParameter>,
        Vec<(NodeId, usize)>,
        Option<SomasInfo>,
    ) {
        (
            self.nodes,
            self.inputs,
            self.parameters,
            self.outputs,
            self.somas,
        )
    }

    /// Structural checks; returns the first violation found
    pub fn validate(&self) -> RuntimeResult<()> {
        let parameter_keys: HashSet<&str> =
            self.parameters.iter().map(|p| p.key.as_str()).collect();
        if parameter_keys.len() != self.parameters.len() {
            return Err(RuntimeError::InvalidGraph(
                "duplicate parameter key".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if !names.insert(node.name.as_str()) {
                return Err(RuntimeError::InvalidGraph(format!(
                    "duplicate node name {}",
                    node.name
                )));
            }
            if node.inputs.len() != node.input_infos.len() {
                return Err(RuntimeError::ArityMismatch {
                    node: node.name.clone(),
                    what: "input info",
                    expected: node.inputs.len(),
                    actual: node.input_infos.len(),
                });
            }

            for (slot, source) in node.inputs.iter().enumerate() {
                match source {
                    InputSource::Node {
                        node: producer,
                        output,
                    } => {
                        if *producer >= id {
                            return Err(RuntimeError::InvalidGraph(format!(
                                "node {} input {} refers to node {} which is not earlier in execution order",
                                node.name, slot, producer
                            )));
                        }
                        let produced = self.nodes[*producer].outputs.len();
                        if *output >= produced {
                            return Err(RuntimeError::IndexOutOfRange {
                                node: self.nodes[*producer].name.clone(),
                                what: "output",
                                index: *output,
                                len: produced,
                            });
                        }
                    }
                    InputSource::GraphInput(index) => {
                        if *index >= self.inputs.len() {
                            return Err(RuntimeError::IndexOutOfRange {
                                node: node.name.clone(),
                                what: "graph input",
                                index: *index,
                                len: self.inputs.len(),
                            });
                        }
                    }
                    InputSource::Parameter(key) => {
                        if !parameter_keys.contains(key.as_str()) {
                            return Err(RuntimeError::InvalidGraph(format!(
                                "node {} uses undeclared parameter {}",
                                node.name, key
                            )));
                        }
                    }
                    InputSource::Remote => {}
                }
            }

            for dep in &node.control_deps {
                if *dep >= id {
                    return Err(RuntimeError::InvalidGraph(format!(
                        "node {} has a control dependency on node {} which is not earlier",
                        node.name, dep
                    )));
                }
            }

            for (output, input) in &node.ref_map {
                if *output >= node.outputs.len() {
                    return Err(RuntimeError::IndexOutOfRange {
                        node: node.name.clone(),
                        what: "ref output",
                        index: *output,
                        len: node.outputs.len(),
                    });
                }
                if *input >= node.inputs.len() {
                    return Err(RuntimeError::IndexOutOfRange {
                        node: node.name.clone(),
                        what: "ref input",
                        index: *input,
                        len: node.inputs.len(),
                    });
                }
            }
        }

        for (position, (node, output)) in self.outputs.iter().enumerate() {
            let producer = self.nodes.get(*node).ok_or(RuntimeError::IndexOutOfRange {
                node: format!("graph output {}", position),
                what: "node",
                index: *node,
                len: self.nodes.len(),
            })?;
            if *output >= producer.outputs.len() {
                return Err(RuntimeError::IndexOutOfRange {
                    node: producer.name.clone(),
                    what: "output",
                    index: *output,
                    len: producer.outputs.len(),
                });
            }
            let covered = producer
                .somas
                .as_ref()
                .and_then(|p| p.outputs.get(*output).copied().flatten())
                .is_some();
            if covered {
                return Err(RuntimeError::InvalidGraph(format!(
                    "graph output {} of node {} is placed in the static memory plan",
                    position, producer.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use crate::kernel::{DType, KernelTensor, LaunchArgs, ResizeStatus};

    struct Nop;

    impl KernelMod for Nop {
        fn name(&self) -> &str {
            "Nop"
        }
        fn resize(&mut self, _: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
            ResizeStatus::Ok
        }
        fn launch(&self, _: &LaunchArgs<'_>, _: StreamId, _: &dyn DeviceContext) -> bool {
            true
        }
        fn output_size_list(&self) -> Vec<usize> {
            vec![16]
        }
    }

    fn info() -> TensorInfo {
        TensorInfo::new(vec![4], DType::F32)
    }

    fn node(name: &str) -> GraphNode {
        GraphNode::new(name, Box::new(Nop)).with_output(info())
    }

    #[test]
    fn test_valid_chain() {
        let mut graph = KernelGraph::new();
        let x = graph.add_input(info());
        let a = graph.add_node(node("a").with_input(InputSource::GraphInput(x), info()));
        let b = graph.add_node(
            node("b").with_input(InputSource::Node { node: a, output: 0 }, info()),
        );
        graph.mark_output(b, 0);
        assert!(graph.validate().is_ok());
        assert_eq!(graph.stream_ids(), vec![0]);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let mut graph = KernelGraph::new();
        graph.add_node(node("a").with_input(InputSource::Node { node: 1, output: 0 }, info()));
        graph.add_node(node("b"));
        let err = graph.validate().unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_output_index_out_of_range() {
        let mut graph = KernelGraph::new();
        let a = graph.add_node(node("a"));
        graph.mark_output(a, 3);
        assert!(matches!(
            graph.validate(),
            Err(RuntimeError::IndexOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn test_ref_map_range_checked() {
        let mut graph = KernelGraph::new();
        graph.add_node(node("a").with_ref(0, 2));
        assert!(matches!(
            graph.validate(),
            Err(RuntimeError::IndexOutOfRange { what: "ref input", .. })
        ));
    }

    #[test]
    fn test_undeclared_parameter_rejected() {
        let mut graph = KernelGraph::new();
        graph.add_node(node("a").with_input(InputSource::Parameter("w".into()), info()));
        assert!(graph.validate().is_err());

        let mut graph = KernelGraph::new();
        graph.add_parameter("w", info());
        graph.add_node(node("a").with_input(InputSource::Parameter("w".into()), info()));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_somas_graph_output_rejected() {
        let mut graph = KernelGraph::new();
        let a = graph.add_node(node("a").with_somas(SomasPlacement {
            outputs: vec![Some(0)],
            workspaces: vec![],
        }));
        graph.mark_output(a, 0);
        assert!(graph.validate().is_err());
    }
}

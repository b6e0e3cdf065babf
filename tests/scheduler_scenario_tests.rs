//! End-to-end scheduler scenarios on the host device

mod common;

use std::sync::Arc;

use common::*;
use kernelforge::actor::ActorPhase;
use kernelforge::device::DeviceType;
use kernelforge::error::ErrorCategory;
use kernelforge::graph::{GraphNode, InputSource};
use kernelforge::kernel::{Format, ShapeKind};
use kernelforge::{KernelGraph, RuntimeError};

/// x -> A(*2) -> B(*3) -> C(*1) -> output
fn linear_chain(log: &Arc<KernelLog>) -> KernelGraph {
    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(4));
    let a = graph.add_node(
        GraphNode::new("A", Box::new(Scale::new("ScaleA", 2.0, 4).logged(log)))
            .with_input(InputSource::GraphInput(x), f32_info(4))
            .with_output(f32_info(4)),
    );
    let b = graph.add_node(
        GraphNode::new("B", Box::new(Scale::new("ScaleB", 3.0, 4).logged(log)))
            .with_input(InputSource::Node { node: a, output: 0 }, f32_info(4))
            .with_output(f32_info(4)),
    );
    let c = graph.add_node(
        GraphNode::new("C", Box::new(Scale::new("ScaleC", 1.0, 4).logged(log)))
            .with_input(InputSource::Node { node: b, output: 0 }, f32_info(4))
            .with_output(f32_info(4)),
    );
    graph.mark_output(c, 0);
    graph
}

#[test]
fn test_linear_chain_fires_each_actor_once() {
    let device = host_device();
    let log = KernelLog::new();
    let scheduler = build(linear_chain(&log), &device, config());

    let outputs = scheduler.run(&[input(&[1.0, 2.0, 3.0, 4.0])]).unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].to_f32(), vec![6.0, 12.0, 18.0, 24.0]);
    assert_eq!(log.events(), vec!["launch:ScaleA", "launch:ScaleB", "launch:ScaleC"]);

    let summary = scheduler.summary();
    for name in ["A", "B", "C"] {
        assert_eq!(summary.actors[name].fires, 1, "{} fires", name);
        assert_eq!(summary.actors[name].launches, 1, "{} launches", name);
    }
    assert_eq!(summary.actors["C"].messages_sent, 1);
    assert_eq!(summary.runs, 1);
    assert_eq!(summary.failed_runs, 0);

    assert_eq!(device.stats().live_allocations, 0);
    for actor in scheduler.actors() {
        assert_eq!(actor.phase(), ActorPhase::Idle);
    }
}

#[test]
fn test_static_graph_replay_is_bit_identical() {
    let device = host_device();
    let log = KernelLog::new();
    let scheduler = build(linear_chain(&log), &device, config());
    let x = input(&[0.1, -2.5, 3.75, 1e-3]);

    let first = scheduler.run(&[x.clone()]).unwrap();
    let second = scheduler.run(&[x]).unwrap();

    assert_eq!(first[0].data, second[0].data);
    assert_eq!(scheduler.runs(), 2);
    assert_eq!(device.stats().live_allocations, 0);
}

#[test]
fn test_control_arrow_orders_independent_nodes() {
    let device = host_device();
    let log = KernelLog::new();
    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(2));
    let a = graph.add_node(
        GraphNode::new("A", Box::new(Scale::new("ScaleA", 2.0, 2).logged(&log)))
            .with_input(InputSource::GraphInput(x), f32_info(2))
            .with_output(f32_info(2)),
    );
    let b = graph.add_node(
        GraphNode::new("B", Box::new(Scale::new("ScaleB", 5.0, 2).logged(&log)))
            .with_input(InputSource::GraphInput(x), f32_info(2))
            .with_output(f32_info(2))
            .after(a),
    );
    graph.mark_output(a, 0);
    graph.mark_output(b, 0);

    let scheduler = build(graph, &device, config());
    assert_eq!(scheduler.actor("B").unwrap().dependencies(), 2);

    for _ in 0..3 {
        let outputs = scheduler.run(&[input(&[1.0, 2.0])]).unwrap();
        assert_eq!(outputs[0].to_f32(), vec![2.0, 4.0]);
        assert_eq!(outputs[1].to_f32(), vec![5.0, 10.0]);
    }
    let events = log.events();
    for pair in events.chunks(2) {
        assert_eq!(pair, ["launch:ScaleA", "launch:ScaleB"]);
    }
    assert_eq!(device.stats().live_allocations, 0);
}

#[test]
fn test_dynamic_shape_resized_before_launch() {
    let device = host_device();
    let log = KernelLog::new();
    let kernel = Dynamic::new("Dyn", &log);
    let mismatches = kernel.mismatch_counter();

    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(4));
    let d = graph.add_node(
        GraphNode::new("D", Box::new(kernel))
            .with_input(InputSource::GraphInput(x), f32_info(4))
            .with_output(f32_info(4))
            .with_shape_kind(ShapeKind::DYNAMIC_SHAPE),
    );
    graph.mark_output(d, 0);
    let scheduler = build(graph, &device, config());
    let actor = scheduler.actor("D").unwrap().clone();

    let outputs = scheduler.run(&[input(&[1.0; 4])]).unwrap();
    assert_eq!(outputs[0].info.shape, vec![4]);
    assert_eq!(actor.workspaces().len(), 1);

    let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
    let outputs = scheduler.run(&[input(&values)]).unwrap();
    assert_eq!(outputs[0].info.shape, vec![8]);
    assert_eq!(outputs[0].to_f32(), values);
    assert_eq!(actor.output_tensors()[0].size(), 32);
    assert_eq!(actor.workspaces().len(), 2);
    // input head, output, two workspaces
    assert_eq!(actor.memory_free_list().len(), 4);

    assert_eq!(
        log.events(),
        vec![
            "infer:Dyn", "resize:Dyn", "launch:Dyn",
            "infer:Dyn", "resize:Dyn", "launch:Dyn",
        ]
    );
    assert_eq!(mismatches.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(device.stats().live_allocations, 0);
}

#[test]
fn test_in_place_output_skips_allocation_and_launch() {
    let device = host_device();
    let log = KernelLog::new();
    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(4));
    let a = graph.add_node(
        GraphNode::new("A", Box::new(Scale::new("ScaleA", 2.0, 4)))
            .with_input(InputSource::GraphInput(x), f32_info(4))
            .with_output(f32_info(4)),
    );
    let b = graph.add_node(
        GraphNode::new("B", Box::new(InPlace::new(4, &log)))
            .with_input(InputSource::Node { node: a, output: 0 }, f32_info(4))
            .with_output(f32_info(4))
            .with_ref(0, 0)
            .launch_skippable(),
    );
    graph.mark_output(b, 0);
    let scheduler = build(graph, &device, config());

    let producer = scheduler.actor("A").unwrap();
    let in_place = scheduler.actor("B").unwrap();
    assert!(Arc::ptr_eq(
        &producer.output_tensors()[0],
        &in_place.output_tensors()[0]
    ));
    assert!(in_place.memory_alloc_list().is_empty());

    let allocs_before = device.stats().alloc_count;
    let outputs = scheduler.run(&[input(&[1.0, 2.0, 3.0, 4.0])]).unwrap();
    assert_eq!(outputs[0].to_f32(), vec![2.0, 4.0, 6.0, 8.0]);

    // graph input and A's output only
    assert_eq!(device.stats().alloc_count - allocs_before, 2);
    assert_eq!(log.launches(), 0);
    let stats = scheduler.telemetry().actor("B").unwrap();
    assert_eq!(stats.skipped_launches, 1);
    assert_eq!(stats.launches, 0);
    assert_eq!(device.stats().live_allocations, 0);
}

#[test]
fn test_skippable_node_without_alias_fails_launch() {
    let device = host_device();
    let log = KernelLog::new();
    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(4));
    let b = graph.add_node(
        GraphNode::new("B", Box::new(InPlace::new(4, &log)))
            .with_input(InputSource::GraphInput(x), f32_info(4))
            // layout change keeps the output from borrowing the input
            .with_output(f32_info(4).with_format(Format::Nhwc))
            .with_ref(0, 0)
            .launch_skippable(),
    );
    graph.mark_output(b, 0);
    let scheduler = build(graph, &device, config());
    assert_eq!(scheduler.actor("B").unwrap().memory_alloc_list().len(), 1);

    let err = scheduler.run(&[input(&[1.0; 4])]).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::LaunchFailed { ref node, ref reason }
            if node == "B" && reason.contains("do not alias")
    ));
    assert_eq!(log.launches(), 0);
    let stats = scheduler.telemetry().actor("B").unwrap();
    assert_eq!(stats.skipped_launches, 0);
    assert_eq!(stats.launches, 0);
    assert_eq!(device.stats().live_allocations, 0);
}

#[test]
fn test_in_place_update_through_copy_reaches_parameter() {
    let device = host_device();
    let mut graph = KernelGraph::new();
    graph.add_parameter("w", f32_info(4).with_format(Format::Nhwc));
    let acc = graph.add_node(
        GraphNode::new("Acc", Box::new(Accumulate::new(4)))
            .with_input(InputSource::Parameter("w".to_string()), f32_info(4))
            .with_output(f32_info(4))
            .with_ref(0, 0),
    );
    graph.mark_output(acc, 0);
    let scheduler = build(graph, &device, config());
    scheduler.bind_parameter("w", &input(&[0.0; 4])).unwrap();

    for round in 1..=3 {
        let outputs = scheduler.run(&[]).unwrap();
        assert_eq!(outputs[0].to_f32(), vec![round as f32; 4], "round {}", round);
    }

    let actor = scheduler.actor("Acc").unwrap();
    let scratch = actor.input_copy(0).unwrap();
    let weight = scheduler.parameter("w").unwrap();
    assert_eq!(weight.format(), Format::Nhwc);
    assert_eq!(
        read_f32(device.as_ref(), &weight.kernel_tensor()).unwrap(),
        vec![3.0; 4]
    );
    let linked = scheduler.runtime().copy_store().fetch(&scratch).unwrap().unwrap();
    assert!(Arc::ptr_eq(&linked, weight));
    // copy in and write back on every run
    assert_eq!(device.stats().copy_count, 6);
    assert_eq!(scheduler.telemetry().actor("Acc").unwrap().input_copies, 3);
}

#[test]
fn test_format_mismatch_copies_into_reused_scratch() {
    let device = host_device();
    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(4).with_format(Format::Nhwc));
    let a = graph.add_node(
        GraphNode::new("A", Box::new(Scale::new("ScaleA", 2.0, 4)))
            .with_input(InputSource::GraphInput(x), f32_info(4))
            .with_output(f32_info(4)),
    );
    graph.mark_output(a, 0);
    let scheduler = build(graph, &device, config());
    let actor = scheduler.actor("A").unwrap().clone();

    let outputs = scheduler.run(&[input(&[1.0, 2.0, 3.0, 4.0])]).unwrap();
    assert_eq!(outputs[0].to_f32(), vec![2.0, 4.0, 6.0, 8.0]);
    let scratch = actor.input_copy(0).unwrap();
    assert_eq!(scratch.format(), Format::Default);

    scheduler.run(&[input(&[1.0, 1.0, 1.0, 1.0])]).unwrap();
    assert!(Arc::ptr_eq(&scratch, &actor.input_copy(0).unwrap()));
    assert_eq!(scheduler.telemetry().actor("A").unwrap().input_copies, 2);
    assert_eq!(device.stats().copy_count, 2);

    // only the scratch copy stays allocated between runs
    assert_eq!(device.stats().live_allocations, 1);
    drop(scheduler);
    drop(actor);
    drop(scratch);
    assert_eq!(device.stats().live_allocations, 0);
}

#[test]
fn test_input_from_other_device_type_is_staged_through_host() {
    let host = host_device();
    let accelerator = Arc::new(kernelforge::HostDevice::new(1).with_device_type(DeviceType::Gpu));
    let mut graph = KernelGraph::new();
    let x = graph.add_input_on(f32_info(4), 0);
    let a = graph.add_node(
        GraphNode::new("A", Box::new(Scale::new("ScaleA", 4.0, 4)))
            .with_input(InputSource::GraphInput(x), f32_info(4))
            .with_output(f32_info(4))
            .on_device(1),
    );
    graph.mark_output(a, 0);
    let runtime = kernelforge::RuntimeContext::new(config()).unwrap();
    let devices: Vec<Arc<dyn kernelforge::DeviceContext>> = vec![host.clone(), accelerator.clone()];
    let scheduler = kernelforge::GraphScheduler::build(graph, devices, runtime).unwrap();

    let outputs = scheduler.run(&[input(&[1.0, 2.0, 3.0, 4.0])]).unwrap();
    assert_eq!(outputs[0].to_f32(), vec![4.0, 8.0, 12.0, 16.0]);
    assert_eq!(scheduler.telemetry().actor("A").unwrap().input_copies, 1);
    // staged through the host, not a device-to-device copy
    assert_eq!(accelerator.stats().copy_count, 0);
    assert_eq!(host.stats().live_allocations, 0);
    // the scratch copy
    assert_eq!(accelerator.stats().live_allocations, 1);
}

#[test]
fn test_continuous_inputs_cannot_be_copied() {
    let device = host_device();
    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(4).with_format(Format::Nhwc));
    let a = graph.add_node(
        GraphNode::new("A", Box::new(Scale::new("ScaleA", 2.0, 4)))
            .with_input(InputSource::GraphInput(x), f32_info(4))
            .with_output(f32_info(4))
            .with_continuous_inputs(),
    );
    graph.mark_output(a, 0);
    let scheduler = build(graph, &device, config());

    let err = scheduler.run(&[input(&[1.0; 4])]).unwrap_err();
    assert!(matches!(err, RuntimeError::CopyFailed { input_index: 0, .. }));
    assert_eq!(device.stats().live_allocations, 0);
}

#[test]
fn test_launch_failure_aborts_successors() {
    let device = host_device();
    let log = KernelLog::new();
    let scheduler = build(linear_chain(&log), &device, config());
    device.fail_kernel("ScaleB");

    let err = scheduler.run(&[input(&[1.0; 4])]).unwrap_err();
    assert!(matches!(err, RuntimeError::LaunchFailed { ref node, .. } if node == "B"));
    assert_eq!(err.category(), ErrorCategory::Launch);
    assert!(err.is_recoverable());

    assert_eq!(log.events(), vec!["launch:ScaleA"]);
    let telemetry = scheduler.telemetry();
    assert_eq!(telemetry.actor("B").unwrap().failures, 1);
    assert!(telemetry.actor("C").map_or(true, |c| c.fires == 0));
    assert_eq!(scheduler.summary().failed_runs, 1);
    assert_eq!(device.stats().live_allocations, 0);
    for actor in scheduler.actors() {
        assert_eq!(actor.phase(), ActorPhase::Idle);
        for output in actor.output_tensors() {
            assert_eq!(output.ref_count(), output.original_ref_count());
        }
    }

    device.clear_kernel_failures();
    let outputs = scheduler.run(&[input(&[1.0; 4])]).unwrap();
    assert_eq!(outputs[0].to_f32(), vec![6.0; 4]);
}

#[test]
fn test_allocation_failure_surfaces_as_resource_error() {
    let device = host_device();
    let log = KernelLog::new();
    let scheduler = build(linear_chain(&log), &device, config());
    // room for the graph input only
    device.set_memory_limit(Some(16));

    let err = scheduler.run(&[input(&[1.0; 4])]).unwrap_err();
    assert!(matches!(err, RuntimeError::AllocationFailed { ref requester, .. } if requester == "A"));
    assert_eq!(err.category(), ErrorCategory::Resource);
    assert_eq!(device.stats().live_allocations, 0);

    device.set_memory_limit(None);
    assert!(scheduler.run(&[input(&[1.0; 4])]).is_ok());
}

#[test]
fn test_wrong_input_rejected_before_run() {
    let device = host_device();
    let log = KernelLog::new();
    let scheduler = build(linear_chain(&log), &device, config());

    let err = scheduler.run(&[]).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidInput { .. }));

    let mut bad = input(&[1.0; 4]);
    bad.data.pop();
    let err = scheduler.run(&[bad]).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidInput { index: 0, .. }));
    assert_eq!(scheduler.runs(), 0);
}

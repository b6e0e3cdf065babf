//! Randomized chains: results and memory state must not depend on chain
//! shape or execution mode

mod common;

use common::*;
use kernelforge::graph::{GraphNode, InputSource};
use kernelforge::scheduler::ExecutionMode;
use kernelforge::KernelGraph;
use proptest::prelude::*;

/// x -> S0 -> S1 -> ... ; every `tap_every`-th node is also a graph output
fn chain(factors: &[f32], tap_every: usize) -> (KernelGraph, Vec<usize>) {
    let mut graph = KernelGraph::new();
    let x = graph.add_input(f32_info(4));
    let mut taps = Vec::new();
    let mut previous: Option<usize> = None;
    for (i, factor) in factors.iter().enumerate() {
        let source = match previous {
            None => InputSource::GraphInput(x),
            Some(node) => InputSource::Node { node, output: 0 },
        };
        let name = format!("S{}", i);
        let node = graph.add_node(
            GraphNode::new(name.clone(), Box::new(Scale::new(&name, *factor, 4)))
                .with_input(source, f32_info(4))
                .with_output(f32_info(4)),
        );
        if i % tap_every == 0 || i + 1 == factors.len() {
            graph.mark_output(node, 0);
            taps.push(i);
        }
        previous = Some(node);
    }
    (graph, taps)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_chain_matches_host_product(
        factors in prop::collection::vec(-3i8..=3, 1..7),
        values in prop::collection::vec(-8i8..=8, 4),
        tap_every in 1usize..4,
        staged in any::<bool>(),
    ) {
        let factors: Vec<f32> = factors.into_iter().map(f32::from).collect();
        let values: Vec<f32> = values.into_iter().map(f32::from).collect();
        let mode = if staged { ExecutionMode::MultiStage } else { ExecutionMode::SinglePipeline };

        let device = host_device();
        let (graph, taps) = chain(&factors, tap_every);
        let scheduler = build(graph, &device, config().with_execution_mode(mode));

        for _ in 0..2 {
            let outputs = scheduler.run(&[input(&values)]).unwrap();
            prop_assert_eq!(outputs.len(), taps.len());
            for (output, tap) in outputs.iter().zip(&taps) {
                let product: f32 = factors[..=*tap].iter().product();
                let expected: Vec<f32> = values.iter().map(|v| v * product).collect();
                prop_assert_eq!(output.to_f32(), expected);
            }
            prop_assert_eq!(device.stats().live_allocations, 0);
        }

        let summary = scheduler.summary();
        prop_assert_eq!(summary.total_fires, factors.len() * 2);
        prop_assert_eq!(summary.failed_runs, 0);
    }
}

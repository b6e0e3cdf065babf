//! Scheduler Benchmark Suite
//!
//! Per-run overhead of the actor scheduler on the host device:
//! - linear chains of increasing length
//! - wide fan-out/fan-in graphs
//! - single pipeline vs multi-stage execution
//! - direct vs message-mode memory requests
//!
//! Run with: `cargo bench --bench scheduler_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kernelforge::context::RuntimeContext;
use kernelforge::device::{DeviceContext, HostDevice, StreamId};
use kernelforge::graph::{GraphNode, InputSource};
use kernelforge::kernel::{
    bytes_to_f32, f32_to_bytes, DType, KernelMod, KernelTensor, LaunchArgs, ResizeStatus,
    TensorInfo,
};
use kernelforge::scheduler::{ExecutionMode, MemoryRequestMode, SchedulerConfig};
use kernelforge::{GraphScheduler, HostTensor, KernelGraph};

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run_time<F>(&self, mut f: F) -> Result<BenchmarkResult>
    where
        F: FnMut() -> Result<()>,
    {
        for _ in 0..self.warmup_iterations {
            f()?;
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            f()?;
            durations.push(start.elapsed());
        }

        Ok(BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        })
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let mut sorted = self.durations.clone();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let avg = total / self.iterations.max(1) as u32;
        let (Some(min), Some(max)) = (sorted.first(), sorted.last()) else {
            return;
        };
        let p50 = sorted[sorted.len() / 2];
        let p99 = sorted[(sorted.len() * 99) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?} ({:.3} ms)", avg, avg.as_secs_f64() * 1000.0);
        println!("Min:     {:?}", min);
        println!("Max:     {:?}", max);
        println!("P50:     {:?}", p50);
        println!("P99:     {:?}", p99);
        println!("Runs/s:  {:.0}", 1.0 / avg.as_secs_f64().max(f64::EPSILON));
    }
}

/// `out = in * factor`
struct Scale {
    name: String,
    factor: f32,
    len: usize,
}

impl KernelMod for Scale {
    fn name(&self) -> &str {
        &self.name
    }

    fn resize(&mut self, _: &[KernelTensor], _: &[KernelTensor]) -> ResizeStatus {
        ResizeStatus::Ok
    }

    fn launch(&self, args: &LaunchArgs<'_>, _: StreamId, device: &dyn DeviceContext) -> bool {
        let Ok(bytes) = device.read_to_host(args.inputs[0].ptr, args.inputs[0].size) else {
            return false;
        };
        let scaled: Vec<f32> = bytes_to_f32(&bytes).iter().map(|v| v * self.factor).collect();
        device
            .write_from_host(args.outputs[0].ptr, &f32_to_bytes(&scaled))
            .is_ok()
    }

    fn output_size_list(&self) -> Vec<usize> {
        vec![self.len * 4]
    }
}

fn info(len: usize) -> TensorInfo {
    TensorInfo::new(vec![len], DType::F32)
}

fn scale(name: String, len: usize) -> Box<Scale> {
    Box::new(Scale {
        name,
        factor: 1.0,
        len,
    })
}

fn linear_chain(depth: usize, len: usize) -> KernelGraph {
    let mut graph = KernelGraph::new();
    let x = graph.add_input(info(len));
    let mut source = InputSource::GraphInput(x);
    let mut last = 0;
    for i in 0..depth {
        let name = format!("chain{}", i);
        last = graph.add_node(
            GraphNode::new(name.clone(), scale(name, len))
                .with_input(source, info(len))
                .with_output(info(len)),
        );
        source = InputSource::Node {
            node: last,
            output: 0,
        };
    }
    graph.mark_output(last, 0);
    graph
}

/// One input fanned out to `width` nodes, each its own graph output
fn fan_out(width: usize, len: usize) -> KernelGraph {
    let mut graph = KernelGraph::new();
    let x = graph.add_input(info(len));
    for i in 0..width {
        let name = format!("branch{}", i);
        let node = graph.add_node(
            GraphNode::new(name.clone(), scale(name, len))
                .with_input(InputSource::GraphInput(x), info(len))
                .with_output(info(len)),
        );
        graph.mark_output(node, 0);
    }
    graph
}

fn scheduler(graph: KernelGraph, config: SchedulerConfig) -> Result<GraphScheduler> {
    let runtime = RuntimeContext::new(config).context("runtime")?;
    let device: Arc<dyn DeviceContext> = Arc::new(HostDevice::new(0));
    GraphScheduler::build(graph, vec![device], runtime).context("build scheduler")
}

fn bench_graph(name: &str, graph: KernelGraph, config: SchedulerConfig, len: usize) -> Result<()> {
    let scheduler = scheduler(graph, config)?;
    let values = vec![1.0f32; len];
    let input = HostTensor::from_f32(vec![len], &values);
    let result = Benchmark::new(name, 200).run_time(|| {
        let outputs = scheduler.run(std::slice::from_ref(&input))?;
        black_box(outputs);
        Ok(())
    })?;
    result.report();
    Ok(())
}

fn benchmark_chain_depth() -> Result<()> {
    println!("\n[Linear Chains]");
    println!("================");
    for depth in [1, 8, 32, 128] {
        bench_graph(
            &format!("chain depth {}", depth),
            linear_chain(depth, 256),
            SchedulerConfig::new(),
            256,
        )?;
    }
    Ok(())
}

fn benchmark_fan_out() -> Result<()> {
    println!("\n[Fan-out]");
    println!("==========");
    for width in [4, 32, 128] {
        bench_graph(
            &format!("fan-out width {}", width),
            fan_out(width, 256),
            SchedulerConfig::new(),
            256,
        )?;
    }
    Ok(())
}

fn benchmark_execution_modes() -> Result<()> {
    println!("\n[Execution Modes]");
    println!("==================");
    for mode in [ExecutionMode::SinglePipeline, ExecutionMode::MultiStage] {
        bench_graph(
            &format!("chain depth 32, {:?}", mode),
            linear_chain(32, 1024),
            SchedulerConfig::new().with_execution_mode(mode),
            1024,
        )?;
    }
    Ok(())
}

fn benchmark_memory_modes() -> Result<()> {
    println!("\n[Memory Request Modes]");
    println!("=======================");
    for mode in [MemoryRequestMode::Synchronous, MemoryRequestMode::Message] {
        bench_graph(
            &format!("fan-out width 32, {:?}", mode),
            fan_out(32, 1024),
            SchedulerConfig::new().with_memory_mode(mode),
            1024,
        )?;
    }
    Ok(())
}

fn main() -> Result<()> {
    kernelforge::logging::init_logging_default();
    println!("====================================");
    println!("kernelforge Scheduler Benchmark Suite");
    println!("====================================");

    benchmark_chain_depth()?;
    benchmark_fan_out()?;
    benchmark_execution_modes()?;
    benchmark_memory_modes()?;

    println!("\n====================================");
    println!("Benchmarks complete");
    Ok(())
}

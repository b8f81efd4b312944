use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tracejit::error::BackendResult;
use tracejit::executor::{ExecutorStats, OptimizedGraphCache};
use tracejit::ir::{Node, TensorSpec};
use tracejit::passes::FusionPolicy;
use tracejit::{
    Backend, CallArityError, Error, ExecutorConfig, ExecutorState, GraphExecutor, OptimizePolicy,
    Returned, TraceIdentityError, TraceInput, TraceOutput, Traced, TracingState,
};
use tracejit_backend_ref_cpu::{CpuBackend, CpuTensor};

/// Forwards to the reference backend and counts executed nodes.
struct CountingBackend {
    inner: CpuBackend,
    nodes: AtomicUsize,
    fuse: bool,
}

impl CountingBackend {
    fn new(fuse: bool) -> Self {
        Self {
            inner: CpuBackend::new(),
            nodes: AtomicUsize::new(0),
            fuse,
        }
    }

    fn take(&self) -> usize {
        self.nodes.swap(0, Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
    type Value = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-counting"
    }

    fn execute_node(&self, node: &Node, inputs: &[CpuTensor]) -> BackendResult<Vec<CpuTensor>> {
        self.nodes.fetch_add(1, Ordering::SeqCst);
        self.inner.execute_node(node, inputs)
    }

    fn type_of(&self, value: &CpuTensor) -> Option<TensorSpec> {
        self.inner.type_of(value)
    }

    fn fusion_policy(&self) -> Option<Arc<dyn FusionPolicy>> {
        if self.fuse {
            self.inner.fusion_policy()
        } else {
            None
        }
    }
}

fn s(value: f64) -> CpuTensor {
    CpuTensor::scalar(value)
}

fn single(returned: Returned<CpuTensor>) -> f64 {
    returned
        .single()
        .and_then(|t| t.as_scalar())
        .expect("single scalar output")
}

fn add_mul<'s>(
    _state: &'s TracingState,
    xs: &[Traced<'s>],
) -> Result<Vec<TraceOutput<'s, CpuTensor>>> {
    let (a, b) = (xs[0], xs[1]);
    Ok(vec![((a + b) * a).into()])
}

fn trace_add_mul<B: Backend<Value = CpuTensor>>(
    backend: Arc<B>,
    config: ExecutorConfig,
) -> Result<GraphExecutor<B>> {
    Ok(GraphExecutor::trace(
        backend,
        add_mul,
        vec![TraceInput::Concrete(s(2.0)), TraceInput::Concrete(s(3.0))],
        Vec::new(),
        config,
    )?)
}

#[test]
fn traced_callback_replays_without_retracing() -> Result<()> {
    let executor = trace_add_mul(Arc::new(CpuBackend::new()), ExecutorConfig::default())?;
    let graph = executor.graph();
    assert_eq!(graph.inputs().len(), 2);
    assert_eq!(graph.outputs().len(), 1);
    assert_eq!(graph.count_op("add"), 1);
    assert_eq!(graph.count_op("mul"), 1);

    assert_eq!(single(executor.run(&[s(2.0), s(3.0)])?), 10.0);
    assert_eq!(single(executor.run(&[s(5.0), s(1.0)])?), 30.0);
    assert_eq!(executor.state(), ExecutorState::Ready);
    let stats = executor.stats();
    assert_eq!(stats.runs, 2);
    assert_eq!(stats.optimizations, 1);
    assert_eq!(stats.compiled_runs, 2);
    Ok(())
}

#[test]
fn captures_are_appended_and_can_be_rebound() -> Result<()> {
    let executor = GraphExecutor::trace(
        Arc::new(CpuBackend::new()),
        |state, xs| {
            let a = xs[0];
            let b = state.capture(0)?;
            Ok(vec![((a + b) * a).into()])
        },
        vec![TraceInput::Concrete(s(2.0))],
        vec![TraceInput::Concrete(s(3.0))],
        ExecutorConfig::default(),
    )?;
    assert_eq!(executor.num_inputs(), 1);
    assert_eq!(executor.num_captures(), 1);
    assert_eq!(single(executor.run(&[s(2.0)])?), 10.0);

    executor.bind_captures(vec![s(10.0)])?;
    assert_eq!(single(executor.run(&[s(2.0)])?), 24.0);

    let err = executor.bind_captures(vec![s(1.0), s(2.0)]).unwrap_err();
    assert!(matches!(
        err,
        Error::CallArity(CallArityError {
            role: "captures",
            expected: 1,
            actual: 2
        })
    ));
    Ok(())
}

#[test]
fn fabricated_output_is_a_trace_identity_error() {
    let result = GraphExecutor::trace(
        Arc::new(CpuBackend::new()),
        |_state, _xs| Ok(vec![TraceOutput::Concrete(s(1.0))]),
        vec![TraceInput::Concrete(s(2.0))],
        Vec::new(),
        ExecutorConfig::default(),
    );
    assert!(matches!(
        result,
        Err(Error::TraceIdentity(TraceIdentityError::Untraced { index: 0 }))
    ));

    let empty = GraphExecutor::trace(
        Arc::new(CpuBackend::new()),
        |_state, _xs| Ok(Vec::new()),
        vec![TraceInput::Concrete(s(2.0))],
        Vec::new(),
        ExecutorConfig::default(),
    );
    assert!(matches!(
        empty,
        Err(Error::TraceIdentity(TraceIdentityError::NoOutputs))
    ));
}

#[test]
fn callback_errors_surface_unchanged() {
    let result = GraphExecutor::trace(
        Arc::new(CpuBackend::new()),
        |_state, _xs| Err(anyhow::anyhow!("host refused")),
        vec![TraceInput::Concrete(s(2.0))],
        Vec::new(),
        ExecutorConfig::default(),
    );
    match result {
        Err(Error::Callback(err)) => assert_eq!(err.to_string(), "host refused"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("trace should fail"),
    }
}

#[test]
fn wrong_arity_keeps_the_optimized_graph() -> Result<()> {
    let executor = trace_add_mul(Arc::new(CpuBackend::new()), ExecutorConfig::default())?;
    executor.run(&[s(1.0), s(1.0)])?;
    let before = executor
        .optimized_graph()
        .map(|g| g as *const _)
        .expect("optimized after first run");

    let err = executor.run(&[s(2.0)]).unwrap_err();
    assert!(matches!(
        err,
        Error::CallArity(CallArityError {
            expected: 2,
            actual: 1,
            ..
        })
    ));

    let after = executor.optimized_graph().map(|g| g as *const _);
    assert_eq!(after, Some(before));
    assert_eq!(single(executor.run(&[s(2.0), s(3.0)])?), 10.0);
    assert_eq!(executor.stats().optimizations, 1);
    Ok(())
}

#[test]
fn tuple_outputs_keep_declared_order() -> Result<()> {
    let executor = GraphExecutor::trace(
        Arc::new(CpuBackend::new()),
        |_state, xs| {
            let (sin, cos) = xs[0].sin_cos();
            Ok(vec![cos.into(), sin.into(), (xs[0] * 2.0).into()])
        },
        vec![TraceInput::Concrete(s(0.0))],
        Vec::new(),
        ExecutorConfig::default(),
    )?;
    let values: Vec<f64> = executor
        .run(&[s(0.0)])?
        .into_vec()
        .into_iter()
        .filter_map(|t| t.as_scalar())
        .collect();
    assert_eq!(values, vec![1.0, 0.0, 0.0]);
    assert!(matches!(executor.run(&[s(1.0)])?, Returned::Tuple(ref v) if v.len() == 3));
    Ok(())
}

#[test]
fn optimized_replay_executes_fewer_nodes() -> Result<()> {
    let trace = |backend: Arc<CountingBackend>, config: ExecutorConfig| {
        GraphExecutor::trace(
            backend,
            |_state, xs| {
                let a = xs[0];
                Ok(vec![((a * a) + (a * a)).into()])
            },
            vec![TraceInput::Concrete(s(3.0))],
            Vec::new(),
            config,
        )
    };

    let plain = Arc::new(CountingBackend::new(false));
    let unoptimized = trace(Arc::clone(&plain), ExecutorConfig::default().with_optimize(false))?;
    assert_eq!(single(unoptimized.run(&[s(3.0)])?), 18.0);
    assert_eq!(plain.take(), 3);

    let counted = Arc::new(CountingBackend::new(false));
    let executor = trace(Arc::clone(&counted), ExecutorConfig::default())?;
    for x in [3.0, 4.0, 5.0] {
        assert_eq!(single(executor.run(&[s(x)])?), 2.0 * x * x);
        assert_eq!(counted.take(), 2);
    }
    let optimized = executor.optimized_graph().expect("ready");
    assert_eq!(optimized.count_op("square"), 1);
    assert_eq!(optimized.count_op("mul"), 0);
    assert_eq!(executor.stats().optimizations, 1);
    Ok(())
}

#[test]
fn elementwise_chain_is_fused_on_the_reference_backend() -> Result<()> {
    let executor = GraphExecutor::trace(
        Arc::new(CpuBackend::new()),
        |_state, xs| Ok(vec![(-xs[0].exp()).tanh().into()]),
        vec![TraceInput::Concrete(CpuTensor::vector(vec![0.0, 1.0]))],
        Vec::new(),
        ExecutorConfig::default(),
    )?;
    let out = executor.run(&[CpuTensor::vector(vec![0.0, 1.0])])?;
    let out = out.single().expect("one output");
    let expected: Vec<f64> = [0.0f64, 1.0].iter().map(|x| (-x.exp()).tanh()).collect();
    assert_eq!(out.data(), expected.as_slice());
    let optimized = executor.optimized_graph().expect("ready");
    assert_eq!(optimized.num_nodes(), 1);
    assert_eq!(optimized.count_op("fused"), 1);
    Ok(())
}

#[test]
fn eager_policy_optimizes_during_construction() -> Result<()> {
    let eager = trace_add_mul(
        Arc::new(CpuBackend::new()),
        ExecutorConfig::default().with_policy(OptimizePolicy::Eager),
    )?;
    assert_eq!(eager.state(), ExecutorState::Ready);
    assert_eq!(eager.stats().optimizations, 1);
    assert_eq!(single(eager.run(&[s(2.0), s(3.0)])?), 10.0);
    assert_eq!(eager.stats().optimizations, 1);

    let lazy = trace_add_mul(Arc::new(CpuBackend::new()), ExecutorConfig::default())?;
    assert_eq!(lazy.state(), ExecutorState::Fresh);
    assert_eq!(lazy.stats(), ExecutorStats::default());
    Ok(())
}

#[test]
fn concurrent_first_runs_optimize_once() -> Result<()> {
    let executor = trace_add_mul(Arc::new(CpuBackend::new()), ExecutorConfig::default())?;
    thread::scope(|scope| {
        for i in 0..8 {
            let executor = &executor;
            scope.spawn(move || {
                let a = i as f64;
                let out = executor.run(&[s(a), s(1.0)]).unwrap();
                assert_eq!(single(out), (a + 1.0) * a);
            });
        }
    });
    let stats = executor.stats();
    assert_eq!(stats.optimizations, 1);
    assert_eq!(stats.runs, 8);
    assert_eq!(stats.compiled_runs, 8);
    Ok(())
}

#[test]
fn print_blocks_lowering_and_falls_back() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let executor = GraphExecutor::trace(
        Arc::clone(&backend),
        |_state, xs| Ok(vec![(xs[0].print() + 1.0).into()]),
        vec![TraceInput::Concrete(s(2.0))],
        Vec::new(),
        ExecutorConfig::default()
            .with_lowering(true)
            .with_strict_lint(true),
    )?;
    assert_eq!(single(executor.run(&[s(4.0)])?), 5.0);
    assert_eq!(executor.state(), ExecutorState::Fallback);
    assert!(executor
        .fallback_reason()
        .expect("fallback reason")
        .contains("print"));
    assert_eq!(backend.printed(), vec![s(4.0)]);
    assert_eq!(executor.stats().fallback_runs, 1);
    Ok(())
}

#[test]
fn lowering_produces_an_exchange_only_graph() -> Result<()> {
    let executor = GraphExecutor::trace(
        Arc::new(CpuBackend::new().without_fusion()),
        |_state, xs| Ok(vec![(xs[0].rsqrt() * xs[1].square()).into()]),
        vec![TraceInput::Concrete(s(4.0)), TraceInput::Concrete(s(3.0))],
        Vec::new(),
        ExecutorConfig::default().with_lowering(true),
    )?;
    assert_eq!(single(executor.run(&[s(4.0), s(3.0)])?), 4.5);
    let optimized = executor.optimized_graph().expect("ready");
    assert!(optimized.nodes().all(|(_, node)| node.op.is_export()));
    assert_eq!(optimized.count_op("Reciprocal"), 1);
    Ok(())
}

#[test]
fn shared_cache_reuses_optimized_graphs() -> Result<()> {
    let cache = Arc::new(OptimizedGraphCache::default());
    let config = ExecutorConfig::default().with_cache(Arc::clone(&cache));
    let backend = Arc::new(CpuBackend::new());

    let first = trace_add_mul(Arc::clone(&backend), config.clone())?;
    let second = trace_add_mul(Arc::clone(&backend), config)?;
    assert_eq!(single(first.run(&[s(2.0), s(3.0)])?), 10.0);
    assert_eq!(single(second.run(&[s(5.0), s(1.0)])?), 30.0);

    assert_eq!(first.stats().optimizations, 1);
    assert_eq!(second.stats().optimizations, 0);
    assert_eq!(second.stats().cache_hits, 1);
    assert_eq!(cache.len(), 1);
    assert!(std::ptr::eq(
        first.optimized_graph().expect("ready"),
        second.optimized_graph().expect("ready"),
    ));
    Ok(())
}

#[test]
fn from_graph_runs_a_prebuilt_graph() -> Result<()> {
    let traced = trace_add_mul(Arc::new(CpuBackend::new()), ExecutorConfig::default())?;
    let rebuilt = GraphExecutor::from_graph(
        Arc::new(CpuBackend::new()),
        traced.graph().clone(),
        ExecutorConfig::default().with_optimize(false),
    )?;
    assert_eq!(single(rebuilt.run(&[s(2.0), s(3.0)])?), 10.0);
    assert_eq!(rebuilt.state(), ExecutorState::Fresh);
    assert_eq!(rebuilt.stats().fallback_runs, 1);
    Ok(())
}

#[test]
fn cache_keeps_fusion_policies_apart() -> Result<()> {
    let cache = Arc::new(OptimizedGraphCache::default());
    let config = ExecutorConfig::default().with_cache(Arc::clone(&cache));
    let trace = |backend: CpuBackend| {
        GraphExecutor::trace(
            Arc::new(backend),
            |_state, xs| Ok(vec![(-xs[0].exp()).tanh().into()]),
            vec![TraceInput::Concrete(CpuTensor::vector(vec![0.0, 1.0]))],
            Vec::new(),
            config.clone(),
        )
    };
    let fused = trace(CpuBackend::new())?;
    let unfused = trace(CpuBackend::new().without_fusion())?;
    let input = [CpuTensor::vector(vec![0.0, 1.0])];
    assert_eq!(fused.run(&input)?, unfused.run(&input)?);

    assert_eq!(unfused.stats().cache_hits, 0);
    assert_eq!(unfused.stats().optimizations, 1);
    assert_eq!(cache.len(), 2);
    assert_eq!(fused.optimized_graph().expect("ready").count_op("fused"), 1);
    assert_eq!(unfused.optimized_graph().expect("ready").count_op("fused"), 0);
    Ok(())
}

type Traceable =
    for<'s> fn(&'s TracingState, &[Traced<'s>]) -> Result<Vec<TraceOutput<'s, CpuTensor>>>;

fn exp_then_log<'s>(
    _state: &'s TracingState,
    xs: &[Traced<'s>],
) -> Result<Vec<TraceOutput<'s, CpuTensor>>> {
    Ok(vec![xs[0].exp().log().into()])
}

fn reciprocal_twice<'s>(
    _state: &'s TracingState,
    xs: &[Traced<'s>],
) -> Result<Vec<TraceOutput<'s, CpuTensor>>> {
    Ok(vec![xs[0].reciprocal().reciprocal().into()])
}

fn plus_zero<'s>(
    _state: &'s TracingState,
    xs: &[Traced<'s>],
) -> Result<Vec<TraceOutput<'s, CpuTensor>>> {
    Ok(vec![(xs[0] + 0.0).into(), (0.0 + xs[0]).into(), (xs[0] + -0.0).into()])
}

fn signed_zero_extremes<'s>(
    _state: &'s TracingState,
    xs: &[Traced<'s>],
) -> Result<Vec<TraceOutput<'s, CpuTensor>>> {
    let x = xs[0];
    Ok(vec![x.maximum(-x).into(), x.minimum(-x).into(), (x - (-x)).into()])
}

#[test]
fn optimized_results_match_uncompiled_bit_for_bit() -> Result<()> {
    let programs: [(&str, Traceable); 4] = [
        ("exp-log", exp_then_log),
        ("reciprocal-twice", reciprocal_twice),
        ("plus-zero", plus_zero),
        ("signed-zero", signed_zero_extremes),
    ];
    let inputs = [1000.0, -1000.0, 5e-324, -0.0, 0.0, f64::INFINITY, 0.5];
    for (name, program) in programs {
        let build = |optimize: bool| {
            GraphExecutor::trace(
                Arc::new(CpuBackend::new()),
                program,
                vec![TraceInput::Concrete(s(1.0))],
                Vec::new(),
                ExecutorConfig::default().with_optimize(optimize),
            )
        };
        let (uncompiled, optimized) = (build(false)?, build(true)?);
        for x in inputs {
            let bits = |returned: Returned<CpuTensor>| -> Vec<u64> {
                returned
                    .into_vec()
                    .iter()
                    .filter_map(|t| t.as_scalar())
                    .map(f64::to_bits)
                    .collect()
            };
            let expected = bits(uncompiled.run(&[s(x)])?);
            let actual = bits(optimized.run(&[s(x)])?);
            assert_eq!(actual, expected, "{name} at {x:e}");
        }
        assert_eq!(optimized.state(), ExecutorState::Ready, "{name}");
    }
    Ok(())
}

#[test]
fn malformed_fused_graph_is_rejected_up_front() {
    use tracejit::ir::{FusedSpec, Operation};
    use tracejit::{Graph, GraphInvariantError};

    let mut graph = Graph::new("malformed");
    let x = graph.add_input(None).unwrap();
    let y = graph
        .push(
            Operation::Fused(FusedSpec {
                num_inputs: 1,
                steps: Vec::new(),
            }),
            &[x],
        )
        .unwrap();
    graph.set_outputs(vec![y]).unwrap();

    let result = GraphExecutor::from_graph(
        Arc::new(CpuBackend::new()),
        graph,
        ExecutorConfig::default().with_lowering(true),
    );
    assert!(matches!(
        result,
        Err(Error::GraphInvariant(GraphInvariantError::MalformedFused { .. }))
    ));
}


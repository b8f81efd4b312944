//! Caching graph executor.
//!
//! An executor owns one traced (or supplied) graph. The first call, or construction when
//! the policy is [`OptimizePolicy::Eager`], runs the pass pipeline exactly once and compiles
//! the result into an [`ExecutionPlan`]. Every later call replays that plan. If the pipeline
//! fails, the executor keeps interpreting the unoptimized graph instead.

mod backend;
mod cache;
mod config;
mod interpreter;
mod plan;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

pub use backend::{execute_fused, Backend};
pub use cache::{OptimizedGraph, OptimizedGraphCache, DEFAULT_CACHE_CAPACITY};
pub use config::{ExecutorConfig, OptimizePolicy};
pub use interpreter::interpret;
pub use plan::ExecutionPlan;

use crate::error::{CallArityError, Error, PipelineError, Result};
use crate::hashing;
use crate::ir::Graph;
use crate::passes::{self, lint, FusionPolicy, NeverFuse, PassContext};
use crate::pipeline::PipelineOptimizer;
use crate::trace::{self, TraceInput, TraceOutput, Traced, TracingState};

/// Keeps [`ExecutorState::Optimizing`] visible while the pipeline runs and clears it even
/// if the pipeline unwinds.
struct OptimizingFlag<'a>(&'a AtomicBool);

impl<'a> OptimizingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for OptimizingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Result of one call, shaped by the number of graph outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Returned<V> {
    Unit,
    Single(V),
    Tuple(Vec<V>),
}

impl<V> Returned<V> {
    pub fn from_values(mut values: Vec<V>) -> Self {
        match values.len() {
            0 => Returned::Unit,
            1 => match values.pop() {
                Some(value) => Returned::Single(value),
                None => Returned::Unit,
            },
            _ => Returned::Tuple(values),
        }
    }

    pub fn into_vec(self) -> Vec<V> {
        match self {
            Returned::Unit => Vec::new(),
            Returned::Single(value) => vec![value],
            Returned::Tuple(values) => values,
        }
    }

    pub fn single(self) -> Option<V> {
        match self {
            Returned::Single(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// No optimization attempted yet.
    Fresh,
    /// The pipeline is running on another thread.
    Optimizing,
    /// An optimized plan is installed.
    Ready,
    /// Optimization failed; calls interpret the unoptimized graph.
    Fallback,
    /// Optimization hit a fatal lint failure; every call reports it.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub runs: usize,
    /// Pipeline invocations. Never exceeds one per executor.
    pub optimizations: usize,
    pub compiled_runs: usize,
    pub fallback_runs: usize,
    pub cache_hits: usize,
}

#[derive(Default)]
struct Counters {
    runs: AtomicUsize,
    optimizations: AtomicUsize,
    compiled_runs: AtomicUsize,
    fallback_runs: AtomicUsize,
    cache_hits: AtomicUsize,
}

enum Compiled {
    Ready(Arc<OptimizedGraph>),
    Fallback { reason: String },
    Failed(PipelineError),
}

pub struct GraphExecutor<B: Backend> {
    backend: Arc<B>,
    graph: Arc<Graph>,
    num_captures: usize,
    captures: RwLock<Vec<Option<B::Value>>>,
    config: ExecutorConfig,
    optimizer: PipelineOptimizer,
    compiled: OnceLock<Compiled>,
    optimizing: AtomicBool,
    counters: Counters,
}

impl<B: Backend> GraphExecutor<B> {
    /// Traces `callback` once and wraps the resulting graph.
    ///
    /// `inputs` seed the ordinary inputs the callback receives as proxies. `captures` seed
    /// extra graph inputs that the callback reaches through [`TracingState::capture`];
    /// concrete captures are bound immediately, placeholders must be bound with
    /// [`bind_captures`](Self::bind_captures) before the first run.
    pub fn trace<F>(
        backend: Arc<B>,
        callback: F,
        inputs: Vec<TraceInput<B::Value>>,
        captures: Vec<TraceInput<B::Value>>,
        config: ExecutorConfig,
    ) -> Result<Self>
    where
        F: for<'s> FnOnce(
            &'s TracingState,
            &[Traced<'s>],
        ) -> anyhow::Result<Vec<TraceOutput<'s, B::Value>>>,
    {
        let num_ordinary = inputs.len();
        let num_captures = captures.len();
        let bound: Vec<Option<B::Value>> = captures
            .iter()
            .map(|capture| match capture {
                TraceInput::Concrete(value) => Some(value.clone()),
                TraceInput::Placeholder(_) => None,
            })
            .collect();

        let mut seeds = inputs;
        seeds.extend(captures);
        let (state, seeded) = trace::enter(&seeds, num_ordinary, |value| backend.type_of(value))?;
        for index in 0..num_captures {
            let proxy = state.capture(index)?;
            debug_assert_eq!(proxy.value(), seeded[num_ordinary + index]);
        }

        let proxies = state.inputs();
        let outputs = callback(&state, &proxies)?;
        let values = state.resolve_outputs(outputs)?;
        drop(proxies);
        state.exit_values(values)?;

        let mut graph = state.into_graph()?;
        let swept = passes::eliminate_dead_code(&mut graph);
        log::debug!(
            "traced graph with {} nodes ({} dead nodes removed)",
            graph.num_nodes(),
            swept.erased_nodes
        );
        Self::build(backend, graph, num_captures, bound, config)
    }

    /// Wraps an existing graph. Every graph input is an ordinary input.
    pub fn from_graph(backend: Arc<B>, graph: Graph, config: ExecutorConfig) -> Result<Self> {
        Self::build(backend, graph, 0, Vec::new(), config)
    }

    /// Wraps an existing graph whose trailing `captures.len()` inputs are captures.
    pub fn from_graph_with_captures(
        backend: Arc<B>,
        graph: Graph,
        captures: Vec<B::Value>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        let count = captures.len();
        let bound = captures.into_iter().map(Some).collect();
        Self::build(backend, graph, count, bound, config)
    }

    fn build(
        backend: Arc<B>,
        mut graph: Graph,
        num_captures: usize,
        captures: Vec<Option<B::Value>>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        lint(&graph)?;
        if num_captures > graph.inputs().len() {
            return Err(CallArityError {
                role: "graph inputs for captures",
                expected: num_captures,
                actual: graph.inputs().len(),
            }
            .into());
        }
        graph.freeze();
        let optimizer = PipelineOptimizer::new(config.pipeline.clone());
        let executor = Self {
            backend,
            graph: Arc::new(graph),
            num_captures,
            captures: RwLock::new(captures),
            config,
            optimizer,
            compiled: OnceLock::new(),
            optimizing: AtomicBool::new(false),
            counters: Counters::default(),
        };
        if executor.config.optimize && executor.config.policy == OptimizePolicy::Eager {
            if let Compiled::Failed(err) = executor.compiled() {
                return Err(err.clone().into());
            }
        }
        Ok(executor)
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The graph as traced or supplied.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The optimized graph, once the executor is [`ExecutorState::Ready`].
    pub fn optimized_graph(&self) -> Option<&Graph> {
        match self.compiled.get() {
            Some(Compiled::Ready(optimized)) => Some(&optimized.graph),
            _ => None,
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self.compiled.get() {
            Some(Compiled::Fallback { reason }) => Some(reason),
            _ => None,
        }
    }

    pub fn state(&self) -> ExecutorState {
        match self.compiled.get() {
            Some(Compiled::Ready(_)) => ExecutorState::Ready,
            Some(Compiled::Fallback { .. }) => ExecutorState::Fallback,
            Some(Compiled::Failed(_)) => ExecutorState::Failed,
            None if self.optimizing.load(Ordering::Acquire) => ExecutorState::Optimizing,
            None => ExecutorState::Fresh,
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            runs: self.counters.runs.load(Ordering::Relaxed),
            optimizations: self.counters.optimizations.load(Ordering::Relaxed),
            compiled_runs: self.counters.compiled_runs.load(Ordering::Relaxed),
            fallback_runs: self.counters.fallback_runs.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Number of ordinary inputs a call must supply.
    pub fn num_inputs(&self) -> usize {
        self.graph.inputs().len() - self.num_captures
    }

    pub fn num_captures(&self) -> usize {
        self.num_captures
    }

    pub fn num_outputs(&self) -> usize {
        self.graph.outputs().len()
    }

    /// Replaces every capture value. Captures are appended after the ordinary inputs on
    /// each call.
    pub fn bind_captures(&self, values: Vec<B::Value>) -> Result<()> {
        if values.len() != self.num_captures {
            return Err(CallArityError {
                role: "captures",
                expected: self.num_captures,
                actual: values.len(),
            }
            .into());
        }
        let mut guard = self.captures.write().expect("capture table poisoned");
        *guard = values.into_iter().map(Some).collect();
        Ok(())
    }

    /// Runs the graph and shapes the outputs as a unit, a single value, or a tuple.
    pub fn run(&self, inputs: &[B::Value]) -> Result<Returned<B::Value>> {
        self.run_flat(inputs).map(Returned::from_values)
    }

    pub fn run_flat(&self, inputs: &[B::Value]) -> Result<Vec<B::Value>> {
        let expected = self.num_inputs();
        if inputs.len() != expected {
            return Err(CallArityError {
                role: "ordinary inputs",
                expected,
                actual: inputs.len(),
            }
            .into());
        }
        let full = self.assemble_inputs(inputs)?;
        self.counters.runs.fetch_add(1, Ordering::Relaxed);

        if !self.config.optimize {
            return self.run_fallback(&full);
        }
        match self.compiled() {
            Compiled::Ready(optimized) => {
                self.counters.compiled_runs.fetch_add(1, Ordering::Relaxed);
                Ok(optimized.plan.execute(self.backend.as_ref(), &full)?)
            }
            Compiled::Fallback { .. } => self.run_fallback(&full),
            Compiled::Failed(err) => Err(err.clone().into()),
        }
    }

    fn assemble_inputs(&self, inputs: &[B::Value]) -> Result<Vec<B::Value>> {
        let captures = self.captures.read().expect("capture table poisoned");
        let mut full = Vec::with_capacity(inputs.len() + captures.len());
        full.extend_from_slice(inputs);
        for (index, capture) in captures.iter().enumerate() {
            match capture {
                Some(value) => full.push(value.clone()),
                None => return Err(Error::CaptureUnbound { index }),
            }
        }
        Ok(full)
    }

    fn run_fallback(&self, inputs: &[B::Value]) -> Result<Vec<B::Value>> {
        self.counters.fallback_runs.fetch_add(1, Ordering::Relaxed);
        interpret(self.backend.as_ref(), &self.graph, inputs)
    }

    fn compiled(&self) -> &Compiled {
        self.compiled.get_or_init(|| {
            let _flag = OptimizingFlag::raise(&self.optimizing);
            self.optimize_once()
        })
    }

    /// Graph, pipeline, backend name and fusion policy. Two backends with the same name but
    /// different policies never share an optimized graph.
    fn cache_key(&self) -> Option<u64> {
        let graph = self.graph.fingerprint()?;
        let backend = hashing::fnv1a_hash(self.backend.backend_name().as_bytes());
        let fusion = match self.backend.fusion_policy() {
            Some(policy) => policy.name(),
            None => NeverFuse.name(),
        };
        let fusion = hashing::fnv1a_hash(fusion.as_bytes());
        Some(hashing::combine(&[
            graph,
            self.optimizer.fingerprint(),
            backend,
            fusion,
        ]))
    }

    fn optimize_once(&self) -> Compiled {
        let key = self.config.cache.as_ref().and_then(|_| self.cache_key());
        if let (Some(cache), Some(key)) = (self.config.cache.as_ref(), key) {
            if let Some(hit) = cache.get(key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Compiled::Ready(hit);
            }
        }

        self.counters.optimizations.fetch_add(1, Ordering::Relaxed);
        let mut graph = (*self.graph).clone();
        let policy = self.backend.fusion_policy();
        let fusion: &dyn FusionPolicy = match policy.as_deref() {
            Some(policy) => policy,
            None => &NeverFuse,
        };
        let mut cx = PassContext::new(fusion);
        let before = graph.num_nodes();

        let result = self
            .optimizer
            .optimize(&mut graph, &mut cx)
            .and_then(|stats| {
                lint(&graph)
                    .map(|_| stats)
                    .map_err(|source| PipelineError::Lint {
                        after: "pipeline",
                        source,
                    })
            });
        let stats = match result {
            Ok(stats) => stats,
            Err(err @ PipelineError::Lint { .. }) if self.config.strict_lint => {
                log::error!("optimizing `{}` broke graph invariants: {err}", self.graph.name());
                return Compiled::Failed(err);
            }
            Err(err) => {
                log::warn!(
                    "optimizing `{}` failed, interpreting the unoptimized graph: {err}",
                    self.graph.name()
                );
                return Compiled::Fallback {
                    reason: err.to_string(),
                };
            }
        };

        let plan = match ExecutionPlan::compile(&graph) {
            Ok(plan) => plan,
            Err(err) => {
                log::warn!("compiling `{}` failed: {err}", self.graph.name());
                return Compiled::Fallback {
                    reason: err.to_string(),
                };
            }
        };
        log::debug!(
            "optimized `{}` on {}: {before} -> {} nodes, {} rewrites",
            self.graph.name(),
            self.backend.backend_name(),
            graph.num_nodes(),
            stats.rewrites_applied
        );

        let optimized = Arc::new(OptimizedGraph { graph, plan });
        if let (Some(cache), Some(key)) = (self.config.cache.as_ref(), key) {
            cache.insert(key, Arc::clone(&optimized));
        }
        Compiled::Ready(optimized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, BackendResult, GraphInvariantError, PassError};
    use crate::ir::{BinaryOp, Literal, Node, Operation};
    use crate::passes::{GraphPass, PassResult};
    use crate::pipeline::{PipelineBuilder, PipelineConfig};

    /// Scalar backend over `f64`, enough to drive the executor without a real kernel crate.
    struct ScalarBackend;

    impl Backend for ScalarBackend {
        type Value = f64;

        fn backend_name(&self) -> &str {
            "scalar"
        }

        fn execute_node(&self, node: &Node, inputs: &[f64]) -> BackendResult<Vec<f64>> {
            match &node.op {
                Operation::Unary(op) => Ok(vec![op.apply(inputs[0])]),
                Operation::Binary(op) => Ok(vec![op.apply(inputs[0], inputs[1])]),
                Operation::Constant(literal) => literal
                    .as_scalar()
                    .map(|value| vec![value])
                    .ok_or_else(|| BackendError::unimplemented("constant", "dense literal")),
                other => Err(BackendError::unimplemented(other.name(), "scalar backend")),
            }
        }
    }

    fn axpy_graph() -> Graph {
        let mut graph = Graph::new("axpy");
        let x = graph.add_input(None).unwrap();
        let y = graph.add_input(None).unwrap();
        let two = graph
            .push(Operation::Constant(Literal::Scalar(2.0)), &[])
            .unwrap();
        let ax = graph.push(Operation::Binary(BinaryOp::Mul), &[two, x]).unwrap();
        let out = graph.push(Operation::Binary(BinaryOp::Add), &[ax, y]).unwrap();
        graph.set_outputs(vec![out]).unwrap();
        graph
    }

    #[test]
    fn lazy_executor_optimizes_on_first_run_only() {
        let executor =
            GraphExecutor::from_graph(Arc::new(ScalarBackend), axpy_graph(), ExecutorConfig::default())
                .unwrap();
        assert_eq!(executor.state(), ExecutorState::Fresh);
        assert_eq!(executor.run(&[3.0, 1.0]).unwrap(), Returned::Single(7.0));
        assert_eq!(executor.state(), ExecutorState::Ready);
        assert_eq!(executor.run(&[0.5, 0.0]).unwrap(), Returned::Single(1.0));
        let stats = executor.stats();
        assert_eq!(stats.optimizations, 1);
        assert_eq!(stats.compiled_runs, 2);
    }

    #[test]
    fn arity_is_checked_before_optimizing() {
        let executor =
            GraphExecutor::from_graph(Arc::new(ScalarBackend), axpy_graph(), ExecutorConfig::default())
                .unwrap();
        let err = executor.run(&[1.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::CallArity(CallArityError {
                expected: 2,
                actual: 1,
                ..
            })
        ));
        assert_eq!(executor.state(), ExecutorState::Fresh);
    }

    #[test]
    fn unbound_capture_is_reported() {
        let executor = GraphExecutor::trace(
            Arc::new(ScalarBackend),
            |state, xs| {
                let scale = state.capture(0)?;
                Ok(vec![(xs[0] * scale).into()])
            },
            vec![TraceInput::Concrete(1.0)],
            vec![TraceInput::Placeholder(None)],
            ExecutorConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            executor.run(&[2.0]),
            Err(Error::CaptureUnbound { index: 0 })
        ));
        executor.bind_captures(vec![4.0]).unwrap();
        assert_eq!(executor.run(&[2.0]).unwrap(), Returned::Single(8.0));
    }

    struct DropOutputs;

    impl GraphPass for DropOutputs {
        fn name(&self) -> &'static str {
            "drop-outputs"
        }

        fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> std::result::Result<PassResult, PassError> {
            graph.replace_outputs(Vec::new());
            Ok(PassResult::default())
        }
    }

    fn broken_executor(strict: bool) -> GraphExecutor<ScalarBackend> {
        let mut executor = GraphExecutor::from_graph(
            Arc::new(ScalarBackend),
            axpy_graph(),
            ExecutorConfig::default().with_strict_lint(strict),
        )
        .unwrap();
        let mut builder = PipelineBuilder::new();
        builder.pass(Arc::new(DropOutputs));
        executor.optimizer = PipelineOptimizer::from_steps(
            builder.finish(),
            PipelineConfig {
                lint_after_each_pass: true,
                ..PipelineConfig::default()
            },
        );
        executor
    }

    #[test]
    fn strict_lint_failure_is_fatal_on_every_call() {
        let executor = broken_executor(true);
        for _ in 0..2 {
            let err = executor.run(&[1.0, 1.0]).unwrap_err();
            assert!(matches!(
                err,
                Error::Pipeline(PipelineError::Lint {
                    source: GraphInvariantError::NoOutputs,
                    ..
                })
            ));
        }
        assert_eq!(executor.state(), ExecutorState::Failed);
        assert_eq!(executor.stats().optimizations, 1);
    }

    #[test]
    fn lenient_lint_failure_falls_back() {
        let executor = broken_executor(false);
        assert_eq!(executor.run(&[1.0, 1.0]).unwrap(), Returned::Single(3.0));
        assert_eq!(executor.state(), ExecutorState::Fallback);
        assert!(executor.fallback_reason().unwrap().contains("drop-outputs"));
        assert_eq!(executor.stats().fallback_runs, 1);
    }

    #[test]
    fn optimize_false_never_runs_the_pipeline() {
        let executor = GraphExecutor::from_graph(
            Arc::new(ScalarBackend),
            axpy_graph(),
            ExecutorConfig::default().with_optimize(false),
        )
        .unwrap();
        executor.run(&[1.0, 1.0]).unwrap();
        assert_eq!(executor.state(), ExecutorState::Fresh);
        assert_eq!(executor.stats().optimizations, 0);
        assert!(executor.optimized_graph().is_none());
    }

    #[test]
    fn returned_shapes_follow_output_count() {
        assert_eq!(Returned::<f64>::from_values(vec![]), Returned::Unit);
        assert_eq!(Returned::from_values(vec![1.0]), Returned::Single(1.0));
        assert_eq!(
            Returned::from_values(vec![1.0, 2.0]),
            Returned::Tuple(vec![1.0, 2.0])
        );
    }
}

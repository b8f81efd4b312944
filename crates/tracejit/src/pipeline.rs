//! Ordered pass sequencing with bounded fixed points and optional lint after every pass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::hashing;
use crate::ir::Graph;
use crate::passes::{
    lint, CanonicalizePass, CommonSubexpressionEliminationPass, DeadCodeEliminationPass,
    ElementwiseFusionPass, ExportPeepholePass, GraphPass, LoweringPass, PassContext, PassResult,
    PeepholePass,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Run lint after every pass and report the first violation.
    pub lint_after_each_pass: bool,
    /// Append lowering into the exchange set and its cleanup.
    pub lower_for_export: bool,
    /// Upper bound on repetitions of the simplification group.
    pub fixed_point_iters: usize,
    /// Log per-pass statistics at debug level.
    pub log_stats: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lint_after_each_pass: cfg!(debug_assertions),
            lower_for_export: false,
            fixed_point_iters: 4,
            log_stats: crate::env::pass_stats_enabled(),
        }
    }
}

pub enum Step {
    Pass(Arc<dyn GraphPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn GraphPass>) {
        self.steps.push(Step::Pass(pass));
    }

    /// Repeats the steps added by `build` until none of them changes the graph, at most
    /// `max_iters` times.
    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

/// Runs an ordered list of passes over a graph.
pub struct PipelineOptimizer {
    steps: Vec<Step>,
    config: PipelineConfig,
    run_counter: AtomicUsize,
}

impl PipelineOptimizer {
    /// Default sequence: simplify to a fixed point, fuse, optionally lower, then sweep.
    pub fn new(config: PipelineConfig) -> Self {
        let mut builder = PipelineBuilder::new();
        builder.fixed_point(config.fixed_point_iters, |p| {
            p.pass(Arc::new(CanonicalizePass));
            p.pass(Arc::new(CommonSubexpressionEliminationPass));
            p.pass(Arc::new(DeadCodeEliminationPass));
            p.pass(Arc::new(PeepholePass::default()));
        });
        builder.pass(Arc::new(ElementwiseFusionPass));
        if config.lower_for_export {
            builder.pass(Arc::new(LoweringPass));
            builder.pass(Arc::new(ExportPeepholePass));
        }
        builder.pass(Arc::new(DeadCodeEliminationPass));
        Self::from_steps(builder.finish(), config)
    }

    pub fn from_steps(steps: Vec<Step>, config: PipelineConfig) -> Self {
        Self {
            steps,
            config,
            run_counter: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pass names in execution order, with fixed-point groups flattened.
    pub fn pass_names(&self) -> Vec<&'static str> {
        fn collect(steps: &[Step], out: &mut Vec<&'static str>) {
            for step in steps {
                match step {
                    Step::Pass(pass) => out.push(pass.name()),
                    Step::FixedPoint { steps, .. } => collect(steps, out),
                }
            }
        }
        let mut names = Vec::new();
        collect(&self.steps, &mut names);
        names
    }

    /// Identifies the pass sequence and the options that change its output.
    pub fn fingerprint(&self) -> u64 {
        let names = self.pass_names();
        let shape = (
            names,
            self.config.lower_for_export,
            self.config.fixed_point_iters,
        );
        hashing::fingerprint(&shape).unwrap_or_default()
    }

    /// Number of completed `optimize` calls.
    pub fn runs(&self) -> usize {
        self.run_counter.load(Ordering::Relaxed)
    }

    pub fn optimize(
        &self,
        graph: &mut Graph,
        cx: &mut PassContext<'_>,
    ) -> Result<PassResult, PipelineError> {
        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed);
        let mut totals = PassResult::default();
        run_steps(&self.steps, graph, cx, &self.config, run_id, &mut totals)?;
        if self.config.log_stats {
            log::debug!(
                "pipeline run {run_id}: {} rewrites, {} nodes erased, {} nodes remain",
                totals.rewrites_applied,
                totals.erased_nodes,
                graph.num_nodes()
            );
        }
        Ok(totals)
    }
}

fn run_steps(
    steps: &[Step],
    graph: &mut Graph,
    cx: &mut PassContext<'_>,
    config: &PipelineConfig,
    run_id: usize,
    totals: &mut PassResult,
) -> Result<bool, PipelineError> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass
                    .run(graph, cx)
                    .map_err(|source| PipelineError::Pass {
                        pass: pass.name(),
                        source,
                    })?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                if config.log_stats {
                    log::debug!(
                        "pipeline run {run_id}: pass {} changed={} rewrites={} erased={}",
                        pass.name(),
                        stats.changed,
                        stats.rewrites_applied,
                        stats.erased_nodes
                    );
                }
                if config.lint_after_each_pass {
                    lint(graph).map_err(|source| PipelineError::Lint {
                        after: pass.name(),
                        source,
                    })?;
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                for _ in 0..*max_iters {
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, graph, cx, config, run_id, &mut local)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

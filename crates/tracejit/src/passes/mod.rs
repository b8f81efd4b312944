//! Graph-to-graph optimization passes.
//!
//! Every pass implements [`GraphPass`] so the pipeline can sequence it, and is also exposed
//! as a free function that runs it on a standalone graph.

mod canonicalize;
mod cse;
mod dce;
mod export_peephole;
pub mod fusion;
mod lint;
mod lowering;
mod peephole;

pub use canonicalize::CanonicalizePass;
pub use cse::CommonSubexpressionEliminationPass;
pub use dce::DeadCodeEliminationPass;
pub use export_peephole::ExportPeepholePass;
pub use fusion::{ElementwiseFusionPass, FusionPolicy, NeverFuse, FUSION_ATTR_LEN};
pub use lint::lint;
pub use lowering::{lowering_rule, LoweringPass, LoweringRule};
pub use peephole::{PeepholePass, PeepholeRule, PEEPHOLE_RULES};

pub use crate::error::PassError;
use crate::ir::Graph;

/// Statistics returned by a pass run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Sweeps performed over the graph.
    pub iterations: usize,
    /// Rewrites applied (merges, folds, fusions, lowerings).
    pub rewrites_applied: usize,
    /// Nodes removed from the graph.
    pub erased_nodes: usize,
}

impl PassResult {
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

/// Services a pass may consult while running.
pub struct PassContext<'a> {
    fusion: &'a dyn FusionPolicy,
}

impl<'a> PassContext<'a> {
    pub fn new(fusion: &'a dyn FusionPolicy) -> Self {
        Self { fusion }
    }

    pub fn fusion_policy(&self) -> &dyn FusionPolicy {
        self.fusion
    }
}

impl Default for PassContext<'static> {
    fn default() -> Self {
        static NEVER: NeverFuse = NeverFuse;
        Self { fusion: &NEVER }
    }
}

pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> Result<PassResult, PassError>;
}

pub fn eliminate_dead_code(graph: &mut Graph) -> PassResult {
    dce::run_dce(graph)
}

pub fn eliminate_common_subexpressions(graph: &mut Graph) -> Result<PassResult, PassError> {
    CommonSubexpressionEliminationPass.run(graph, &mut PassContext::default())
}

pub fn canonicalize(graph: &mut Graph) -> Result<PassResult, PassError> {
    CanonicalizePass.run(graph, &mut PassContext::default())
}

pub fn peephole(graph: &mut Graph) -> Result<PassResult, PassError> {
    PeepholePass::default().run(graph, &mut PassContext::default())
}

pub fn fuse(graph: &mut Graph, policy: &dyn FusionPolicy) -> Result<PassResult, PassError> {
    ElementwiseFusionPass.run(graph, &mut PassContext::new(policy))
}

pub fn lower_for_export(graph: &mut Graph) -> Result<PassResult, PassError> {
    LoweringPass.run(graph, &mut PassContext::default())
}

pub fn export_peephole(graph: &mut Graph) -> Result<PassResult, PassError> {
    ExportPeepholePass.run(graph, &mut PassContext::default())
}

use std::collections::HashSet;

use super::{GraphPass, PassContext, PassError, PassResult};
use crate::ir::{Graph, NodeId, ValueId};

/// Removes nodes whose outputs cannot reach a graph output and that have no side effect.
///
/// Graph inputs are never removed, even when unused.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl GraphPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> Result<PassResult, PassError> {
        Ok(run_dce(graph))
    }
}

pub(super) fn run_dce(graph: &mut Graph) -> PassResult {
    let mut stats = PassResult::default();
    loop {
        stats.iterations += 1;
        let dead = dead_nodes(graph);
        if dead.is_empty() {
            break;
        }
        let removed = graph.remove_nodes(&dead);
        stats.changed = true;
        stats.erased_nodes += removed;
    }
    stats
}

/// Reverse sweep: consumers are visited before producers, so one pass marks everything.
fn dead_nodes(graph: &Graph) -> HashSet<NodeId> {
    let mut live: HashSet<ValueId> = graph.outputs().iter().copied().collect();
    let mut dead = HashSet::new();
    let order: Vec<NodeId> = graph.order().to_vec();
    for id in order.into_iter().rev() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let needed = node.op.is_side_effecting()
            || node.outputs.iter().any(|value| live.contains(value));
        if needed {
            live.extend(node.inputs.iter().copied());
        } else {
            dead.insert(id);
        }
    }
    dead
}

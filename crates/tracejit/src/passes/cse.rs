use std::collections::HashMap;

use super::{GraphPass, PassContext, PassError, PassResult};
use crate::ir::{Graph, GraphRewriter, NodeId};

/// Common-subexpression elimination for pure nodes.
///
/// Hashes `(op, inputs, attrs)` for every side-effect-free node and forwards later
/// duplicates to the first occurrence. The first occurrence always survives, so the
/// result does not depend on hash iteration order.
#[derive(Default)]
pub struct CommonSubexpressionEliminationPass;

impl CommonSubexpressionEliminationPass {
    const NAME: &'static str = "cse";
}

impl GraphPass for CommonSubexpressionEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> Result<PassResult, PassError> {
        let mut rewriter = GraphRewriter::new(graph)?;
        let mut seen: HashMap<Vec<u8>, NodeId> = HashMap::new();
        let mut stats = PassResult {
            iterations: 1,
            ..PassResult::default()
        };

        for id in rewriter.nodes_in_order() {
            let Some(node) = rewriter.node(id) else {
                continue;
            };
            if node.op.is_side_effecting() {
                continue;
            }
            let key = match bincode::serialize(&(&node.op, &node.inputs, &node.attrs)) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };

            let Some(&first) = seen.get(&key) else {
                seen.insert(key, id);
                continue;
            };

            let (duplicate, survivor) = match (rewriter.node(id), rewriter.node(first)) {
                (Some(dup), Some(keep)) => (dup.outputs.clone(), keep.outputs.clone()),
                _ => continue,
            };
            for (from, to) in duplicate.into_iter().zip(survivor) {
                rewriter.replace_all_uses(from, to);
            }
            rewriter.erase_node(id)?;
            stats.changed = true;
            stats.rewrites_applied += 1;
            stats.erased_nodes += 1;
        }

        Ok(stats)
    }
}

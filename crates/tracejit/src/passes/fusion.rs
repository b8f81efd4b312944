//! Elementwise chain fusion.
//!
//! A chain is a run of elementwise nodes where each link's only consumer is the next link
//! and no intermediate value is a graph output. Legality of each link is decided by the
//! backend through [`FusionPolicy`]. A chain of two or more nodes is replaced by a single
//! [`Operation::Fused`] node placed where the last link was.
//!
//! Fused nodes are never fusion candidates themselves, so a second run finds nothing to do.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::{GraphPass, PassContext, PassError, PassResult};
use crate::error::GraphInvariantError;
use crate::ir::{
    Attr, FusedArg, FusedOp, FusedSpec, FusedStep, Graph, GraphRewriter, Node, NodeId, Operation,
    ValueId,
};

pub const FUSION_ATTR_LEN: &str = "fusion_len";

/// Backend-supplied legality predicate.
pub trait FusionPolicy: Send + Sync {
    /// Whether `node` may take part in a fused chain at all.
    fn is_fusible(&self, graph: &Graph, node: &Node) -> bool {
        let _ = graph;
        node.op.is_pure()
    }

    /// Whether `consumer` may be fused directly after `producer`.
    fn can_fuse(&self, graph: &Graph, producer: &Node, consumer: &Node) -> bool;

    /// Identity of the policy in optimized-graph cache keys. Policies whose decisions
    /// depend on configuration should include it.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Policy that rejects every pair. Used when a backend offers no policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverFuse;

impl FusionPolicy for NeverFuse {
    fn is_fusible(&self, _graph: &Graph, _node: &Node) -> bool {
        false
    }

    fn can_fuse(&self, _graph: &Graph, _producer: &Node, _consumer: &Node) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "never"
    }
}

#[derive(Default)]
pub struct ElementwiseFusionPass;

impl ElementwiseFusionPass {
    const NAME: &'static str = "fusion";
}

impl GraphPass for ElementwiseFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> Result<PassResult, PassError> {
        let policy = cx.fusion_policy();
        let mut rewriter = GraphRewriter::new(graph)?;
        let chains = discover_chains(&rewriter, policy);
        let mut stats = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        for chain in chains {
            stats.erased_nodes += chain.len();
            materialize_chain(&mut rewriter, &chain)?;
            stats.rewrites_applied += 1;
            stats.changed = true;
        }
        Ok(stats)
    }
}

fn is_candidate(graph: &Graph, node: &Node, policy: &dyn FusionPolicy) -> bool {
    FusedOp::from_operation(&node.op).is_some() && node.op.is_pure() && policy.is_fusible(graph, node)
}

/// Greedy maximal chains, walked in topological order. Each node joins at most one chain.
fn discover_chains(rewriter: &GraphRewriter<'_>, policy: &dyn FusionPolicy) -> Vec<Vec<NodeId>> {
    let graph = rewriter.graph();
    let mut claimed: HashSet<NodeId> = HashSet::new();
    let mut chains = Vec::new();

    for start in rewriter.nodes_in_order() {
        if claimed.contains(&start) {
            continue;
        }
        let Some(start_node) = graph.node(start) else {
            continue;
        };
        if !is_candidate(graph, start_node, policy) {
            continue;
        }

        let mut chain = vec![start];
        let mut tail = start_node;
        loop {
            let out = tail.outputs[0];
            if rewriter.is_graph_output(out) {
                break;
            }
            let [next] = rewriter.users_of(out) else {
                break;
            };
            let next = *next;
            if claimed.contains(&next) || chain.contains(&next) {
                break;
            }
            let Some(next_node) = graph.node(next) else {
                break;
            };
            if !is_candidate(graph, next_node, policy) || !policy.can_fuse(graph, tail, next_node) {
                break;
            }
            chain.push(next);
            tail = next_node;
        }

        if chain.len() >= 2 {
            claimed.extend(chain.iter().copied());
            chains.push(chain);
        }
    }
    chains
}

fn build_spec(graph: &Graph, chain: &[NodeId]) -> Result<(FusedSpec, Vec<ValueId>), GraphInvariantError> {
    let mut external: Vec<ValueId> = Vec::new();
    let mut produced: HashMap<ValueId, usize> = HashMap::new();
    let mut steps = Vec::with_capacity(chain.len());

    for (step_idx, id) in chain.iter().enumerate() {
        let node = graph
            .node(*id)
            .ok_or(GraphInvariantError::MissingNode { node: *id })?;
        let op = FusedOp::from_operation(&node.op).ok_or_else(|| {
            GraphInvariantError::ArityMismatch {
                node: *id,
                op: node.op.name().to_string(),
                role: "fusible operators",
                expected: 1,
                actual: 0,
            }
        })?;
        let args = node
            .inputs
            .iter()
            .map(|value| match produced.get(value) {
                Some(step) => FusedArg::Step(*step),
                None => {
                    let slot = external
                        .iter()
                        .position(|existing| existing == value)
                        .unwrap_or_else(|| {
                            external.push(*value);
                            external.len() - 1
                        });
                    FusedArg::Input(slot)
                }
            })
            .collect();
        steps.push(FusedStep { op, args });
        produced.insert(node.outputs[0], step_idx);
    }

    Ok((
        FusedSpec {
            num_inputs: external.len(),
            steps,
        },
        external,
    ))
}

fn materialize_chain(rewriter: &mut GraphRewriter<'_>, chain: &[NodeId]) -> Result<(), GraphInvariantError> {
    let Some(&last) = chain.last() else {
        return Ok(());
    };
    let (spec, inputs) = build_spec(rewriter.graph(), chain)?;
    let last_out = rewriter
        .node(last)
        .map(|node| node.outputs[0])
        .ok_or(GraphInvariantError::MissingNode { node: last })?;
    let out_ty = rewriter.graph().value_type(last_out).cloned();

    let mut attrs = BTreeMap::new();
    attrs.insert(FUSION_ATTR_LEN.to_string(), Attr::I64(chain.len() as i64));
    let (_, outputs) =
        rewriter.insert_before(last, Operation::Fused(spec), inputs, attrs, vec![out_ty])?;
    rewriter.replace_all_uses(last_out, outputs[0]);
    for id in chain.iter().rev() {
        rewriter.erase_node(*id)?;
    }
    Ok(())
}

use super::{GraphPass, PassContext, PassError, PassResult};
use crate::error::GraphInvariantError;
use crate::ir::{BinaryOp, Graph, GraphRewriter, Literal, NodeId, Operation, UnaryOp, ValueId};

type RuleResult = Result<bool, GraphInvariantError>;

/// Local rewrite tried at one node. Returns `true` when it changed the graph.
#[derive(Clone, Copy)]
pub struct PeepholeRule {
    pub name: &'static str,
    apply: fn(&mut GraphRewriter<'_>, NodeId) -> RuleResult,
}

impl PeepholeRule {
    pub fn apply(&self, rewriter: &mut GraphRewriter<'_>, node: NodeId) -> RuleResult {
        (self.apply)(rewriter, node)
    }
}

/// Rules in priority order. The first rule that fires at a node wins for that sweep.
///
/// Every rule must reproduce the unrewritten result bit for bit. `pow(x, 2) -> square(x)`
/// is left out because `powf` is not guaranteed to round like `x * x`.
pub const PEEPHOLE_RULES: &[PeepholeRule] = &[
    PeepholeRule {
        name: "cancel-inverse-unary",
        apply: cancel_inverse_unary,
    },
    PeepholeRule {
        name: "cancel-double-transpose",
        apply: cancel_double_transpose,
    },
    PeepholeRule {
        name: "drop-identity-operand",
        apply: drop_identity_operand,
    },
    PeepholeRule {
        name: "mul-self-to-square",
        apply: mul_self_to_square,
    },
    PeepholeRule {
        name: "sub-neg-to-add",
        apply: sub_neg_to_add,
    },
];

/// Table-driven local simplification, applied until no rule fires.
pub struct PeepholePass {
    max_iterations: usize,
}

impl PeepholePass {
    const NAME: &'static str = "peephole";

    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }
}

impl Default for PeepholePass {
    fn default() -> Self {
        Self::new(32)
    }
}

impl GraphPass for PeepholePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> Result<PassResult, PassError> {
        let before = graph.num_nodes();
        let mut rewriter = GraphRewriter::new(graph)?;
        let mut stats = PassResult::default();

        for _ in 0..self.max_iterations {
            stats.iterations += 1;
            let mut applied = 0;
            for id in rewriter.nodes_in_order() {
                if !rewriter.contains(id) {
                    continue;
                }
                for rule in PEEPHOLE_RULES {
                    if rule.apply(&mut rewriter, id)? {
                        log::trace!("peephole {} fired at {id}", rule.name);
                        applied += 1;
                        break;
                    }
                }
            }
            stats.rewrites_applied += applied;
            if applied == 0 {
                break;
            }
        }

        drop(rewriter);
        stats.changed = stats.rewrites_applied > 0;
        stats.erased_nodes = before.saturating_sub(graph.num_nodes());
        Ok(stats)
    }
}

fn op_of(rewriter: &GraphRewriter<'_>, id: NodeId) -> Option<(Operation, Vec<ValueId>)> {
    rewriter
        .node(id)
        .map(|node| (node.op.clone(), node.inputs.clone()))
}

fn producer_of(rewriter: &GraphRewriter<'_>, value: ValueId) -> Option<(Operation, Vec<ValueId>)> {
    let (node, _) = rewriter.producer_op(value)?;
    op_of(rewriter, node)
}

fn scalar_constant(rewriter: &GraphRewriter<'_>, value: ValueId) -> Option<f64> {
    match rewriter.producer_op(value)? {
        (_, Operation::Constant(Literal::Scalar(scalar))) => Some(*scalar),
        _ => None,
    }
}

fn cancel_inverse_unary(rewriter: &mut GraphRewriter<'_>, id: NodeId) -> RuleResult {
    let Some((Operation::Unary(outer), inputs)) = op_of(rewriter, id) else {
        return Ok(false);
    };
    let Some((Operation::Unary(inner), inner_inputs)) = producer_of(rewriter, inputs[0]) else {
        return Ok(false);
    };
    if !outer.cancels(inner) {
        return Ok(false);
    }
    rewriter.forward_to(id, inner_inputs[0])?;
    Ok(true)
}

fn cancel_double_transpose(rewriter: &mut GraphRewriter<'_>, id: NodeId) -> RuleResult {
    let Some((Operation::Transpose, inputs)) = op_of(rewriter, id) else {
        return Ok(false);
    };
    let Some((Operation::Transpose, inner_inputs)) = producer_of(rewriter, inputs[0]) else {
        return Ok(false);
    };
    rewriter.forward_to(id, inner_inputs[0])?;
    Ok(true)
}

fn drop_identity_operand(rewriter: &mut GraphRewriter<'_>, id: NodeId) -> RuleResult {
    let Some((Operation::Binary(op), inputs)) = op_of(rewriter, id) else {
        return Ok(false);
    };
    let (lhs, rhs) = (inputs[0], inputs[1]);
    let exact = |identity: f64, constant: f64| identity.to_bits() == constant.to_bits();
    if let (Some(identity), Some(constant)) = (op.right_identity(), scalar_constant(rewriter, rhs)) {
        if exact(identity, constant) {
            rewriter.forward_to(id, lhs)?;
            return Ok(true);
        }
    }
    if let (Some(identity), Some(constant)) = (op.left_identity(), scalar_constant(rewriter, lhs)) {
        if exact(identity, constant) {
            rewriter.forward_to(id, rhs)?;
            return Ok(true);
        }
    }
    Ok(false)
}

fn mul_self_to_square(rewriter: &mut GraphRewriter<'_>, id: NodeId) -> RuleResult {
    let Some((Operation::Binary(BinaryOp::Mul), inputs)) = op_of(rewriter, id) else {
        return Ok(false);
    };
    if inputs[0] != inputs[1] {
        return Ok(false);
    }
    rewriter.replace_node(id, Operation::Unary(UnaryOp::Square), vec![inputs[0]])?;
    Ok(true)
}

fn sub_neg_to_add(rewriter: &mut GraphRewriter<'_>, id: NodeId) -> RuleResult {
    let Some((Operation::Binary(BinaryOp::Sub), inputs)) = op_of(rewriter, id) else {
        return Ok(false);
    };
    let Some((Operation::Unary(UnaryOp::Neg), neg_inputs)) = producer_of(rewriter, inputs[1])
    else {
        return Ok(false);
    };
    rewriter.replace_node(
        id,
        Operation::Binary(BinaryOp::Add),
        vec![inputs[0], neg_inputs[0]],
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{eliminate_dead_code, peephole};

    fn single_input() -> (Graph, ValueId) {
        let mut graph = Graph::new("g");
        let x = graph.add_input(None).unwrap();
        (graph, x)
    }

    #[test]
    fn double_negation_collapses_to_input() {
        let (mut graph, x) = single_input();
        let n1 = graph.push(Operation::Unary(UnaryOp::Neg), &[x]).unwrap();
        let n2 = graph.push(Operation::Unary(UnaryOp::Neg), &[n1]).unwrap();
        graph.set_outputs(vec![n2]).unwrap();

        let stats = peephole(&mut graph).unwrap();
        assert!(stats.changed);
        assert_eq!(graph.outputs(), &[x]);
        eliminate_dead_code(&mut graph);
        assert_eq!(graph.num_nodes(), 0);
    }

    #[test]
    fn add_negative_zero_forwards_other_operand() {
        let (mut graph, x) = single_input();
        let zero = graph
            .push(Operation::Constant(Literal::Scalar(-0.0)), &[])
            .unwrap();
        let y = graph.push(Operation::Binary(BinaryOp::Add), &[zero, x]).unwrap();
        let z = graph.push(Operation::Unary(UnaryOp::Exp), &[y]).unwrap();
        graph.set_outputs(vec![z]).unwrap();

        peephole(&mut graph).unwrap();
        let exp = graph.producer(z).unwrap();
        assert_eq!(graph.node(exp).unwrap().inputs, vec![x]);
    }

    #[test]
    fn add_positive_zero_is_kept() {
        // -0.0 + 0.0 is +0.0, so forwarding would flip the sign of a negative zero.
        let (mut graph, x) = single_input();
        let zero = graph
            .push(Operation::Constant(Literal::Scalar(0.0)), &[])
            .unwrap();
        let y = graph.push(Operation::Binary(BinaryOp::Add), &[x, zero]).unwrap();
        graph.set_outputs(vec![y]).unwrap();

        let stats = peephole(&mut graph).unwrap();
        assert!(!stats.changed);
        assert_eq!(graph.outputs(), &[y]);
    }

    #[test]
    fn inexact_inverse_pairs_are_kept() {
        for (inner, outer) in [
            (UnaryOp::Exp, UnaryOp::Log),
            (UnaryOp::Reciprocal, UnaryOp::Reciprocal),
        ] {
            let (mut graph, x) = single_input();
            let a = graph.push(Operation::Unary(inner), &[x]).unwrap();
            let b = graph.push(Operation::Unary(outer), &[a]).unwrap();
            graph.set_outputs(vec![b]).unwrap();

            let stats = peephole(&mut graph).unwrap();
            assert!(!stats.changed, "{inner:?} then {outer:?}");
            assert_eq!(graph.num_nodes(), 2);
        }
    }

    #[test]
    fn pow_two_is_not_rewritten() {
        let (mut graph, x) = single_input();
        let two = graph
            .push(Operation::Constant(Literal::Scalar(2.0)), &[])
            .unwrap();
        let y = graph.push(Operation::Binary(BinaryOp::Pow), &[x, two]).unwrap();
        graph.set_outputs(vec![y]).unwrap();

        assert!(!peephole(&mut graph).unwrap().changed);
    }

    #[test]
    fn sub_zero_on_the_left_is_kept() {
        let (mut graph, x) = single_input();
        let zero = graph
            .push(Operation::Constant(Literal::Scalar(0.0)), &[])
            .unwrap();
        let y = graph.push(Operation::Binary(BinaryOp::Sub), &[zero, x]).unwrap();
        graph.set_outputs(vec![y]).unwrap();

        let stats = peephole(&mut graph).unwrap();
        assert!(!stats.changed);
    }

    #[test]
    fn mul_by_self_becomes_square() {
        let (mut graph, x) = single_input();
        let y = graph.push(Operation::Binary(BinaryOp::Mul), &[x, x]).unwrap();
        graph.set_outputs(vec![y]).unwrap();

        peephole(&mut graph).unwrap();
        let out = graph.outputs()[0];
        let node = graph.node(graph.producer(out).unwrap()).unwrap();
        assert_eq!(node.op, Operation::Unary(UnaryOp::Square));
    }

    #[test]
    fn second_run_changes_nothing() {
        let (mut graph, x) = single_input();
        let e = graph.push(Operation::Unary(UnaryOp::Exp), &[x]).unwrap();
        let l = graph.push(Operation::Unary(UnaryOp::Log), &[e]).unwrap();
        let m = graph.push(Operation::Binary(BinaryOp::Mul), &[l, l]).unwrap();
        graph.set_outputs(vec![m]).unwrap();

        peephole(&mut graph).unwrap();
        let once = graph.clone();
        let stats = peephole(&mut graph).unwrap();
        assert!(!stats.changed);
        assert_eq!(graph, once);
    }
}

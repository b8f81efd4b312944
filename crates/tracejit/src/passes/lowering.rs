//! Rewrites internal operators into the exchange operator set ([`ExportOp`]).
//!
//! Every internal operator has an entry in [`lowering_rule`]. The table is an exhaustive
//! match, so adding an operator without deciding how it lowers fails to compile.

use std::collections::BTreeMap;

use super::{GraphPass, PassContext, PassError, PassResult};
use super::lint::check_fused;
use crate::error::{GraphInvariantError, LoweringError};
use crate::ir::{
    ExportOp, FusedArg, FusedOp, FusedSpec, Graph, GraphRewriter, NodeId, Operation, UnaryOp,
    ValueId,
};

/// Operand of a lowered step: an input of the original node or an earlier step's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweredArg {
    Input(usize),
    Step(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredStep {
    pub op: ExportOp,
    pub args: Vec<LoweredArg>,
}

/// How one internal operator is expressed with exchange operators.
#[derive(Debug, Clone, PartialEq)]
pub enum LoweringRule {
    /// Already in the exchange set.
    Keep,
    /// A sequence of exchange steps. `outputs[i]` names the step providing output `i`.
    Expand {
        steps: Vec<LoweredStep>,
        outputs: Vec<usize>,
    },
    /// No exchange equivalent.
    Unsupported,
}

fn step(op: ExportOp, args: &[LoweredArg]) -> LoweredStep {
    LoweredStep {
        op,
        args: args.to_vec(),
    }
}

fn single(op: ExportOp, arity: usize) -> LoweringRule {
    let args: Vec<LoweredArg> = (0..arity).map(LoweredArg::Input).collect();
    LoweringRule::Expand {
        steps: vec![step(op, &args)],
        outputs: vec![0],
    }
}

fn lower_unary(op: UnaryOp) -> Vec<LoweredStep> {
    use LoweredArg::*;
    match ExportOp::from_unary(op) {
        Some(direct) => vec![step(direct, &[Input(0)])],
        None => match op {
            UnaryOp::Rsqrt => vec![
                step(ExportOp::Sqrt, &[Input(0)]),
                step(ExportOp::Reciprocal, &[Step(0)]),
            ],
            UnaryOp::Square => vec![step(ExportOp::Mul, &[Input(0), Input(0)])],
            _ => Vec::new(),
        },
    }
}

pub fn lowering_rule(op: &Operation) -> LoweringRule {
    use LoweredArg::*;
    match op {
        Operation::Export(_) => LoweringRule::Keep,
        Operation::Constant(literal) => single(ExportOp::Constant(literal.clone()), 0),
        Operation::Unary(op) => {
            let steps = lower_unary(*op);
            let last = steps.len().saturating_sub(1);
            LoweringRule::Expand {
                steps,
                outputs: vec![last],
            }
        }
        Operation::Binary(op) => single(ExportOp::from_binary(*op), 2),
        Operation::SinCos => LoweringRule::Expand {
            steps: vec![
                step(ExportOp::Sin, &[Input(0)]),
                step(ExportOp::Cos, &[Input(0)]),
            ],
            outputs: vec![0, 1],
        },
        Operation::MatMul => single(ExportOp::MatMul, 2),
        Operation::Transpose => single(ExportOp::Transpose, 1),
        Operation::ReduceSum { axis } => single(ExportOp::ReduceSum { axis: *axis }, 1),
        Operation::RngUniform { shape } => single(
            ExportOp::RandomUniform {
                shape: shape.clone(),
            },
            0,
        ),
        Operation::Print => LoweringRule::Unsupported,
        Operation::Fused(spec) => lower_fused(spec).unwrap_or(LoweringRule::Unsupported),
    }
}

/// Expands a fused chain step by step. `None` when the chain refers to a step or operand
/// that does not exist.
fn lower_fused(spec: &FusedSpec) -> Option<LoweringRule> {
    use LoweredArg::*;
    let mut steps: Vec<LoweredStep> = Vec::new();
    let mut step_end: Vec<usize> = Vec::with_capacity(spec.steps.len());
    for fused in &spec.steps {
        let args = fused
            .args
            .iter()
            .map(|arg| match arg {
                FusedArg::Input(idx) => Some(Input(*idx)),
                FusedArg::Step(idx) => step_end.get(*idx).map(|end| Step(*end)),
            })
            .collect::<Option<Vec<LoweredArg>>>()?;
        let base = steps.len();
        let expanded = match fused.op {
            FusedOp::Unary(op) => lower_unary(op),
            FusedOp::Binary(op) => vec![step(ExportOp::from_binary(op), &[Input(0), Input(1)])],
        };
        for mut lowered in expanded {
            lowered.args = lowered
                .args
                .iter()
                .map(|arg| match arg {
                    Input(idx) => args.get(*idx).copied(),
                    Step(idx) => Some(Step(base + idx)),
                })
                .collect::<Option<Vec<LoweredArg>>>()?;
            steps.push(lowered);
        }
        step_end.push(steps.len().checked_sub(1)?);
    }
    let last = steps.len().checked_sub(1)?;
    Some(LoweringRule::Expand {
        steps,
        outputs: vec![last],
    })
}

/// Lowers every internal node. Checks the whole graph first, so an unsupported operator
/// leaves the graph untouched.
#[derive(Default)]
pub struct LoweringPass;

impl LoweringPass {
    const NAME: &'static str = "lower-export";
}

impl GraphPass for LoweringPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> Result<PassResult, PassError> {
        let mut plan: Vec<(NodeId, Vec<LoweredStep>, Vec<usize>)> = Vec::new();
        for (id, node) in graph.nodes() {
            if let Operation::Fused(spec) = &node.op {
                check_fused(id, spec)?;
            }
            match lowering_rule(&node.op) {
                LoweringRule::Keep => {}
                LoweringRule::Unsupported => {
                    return Err(LoweringError {
                        op: node.op.name().to_string(),
                        node: id,
                    }
                    .into());
                }
                LoweringRule::Expand { steps, outputs } => plan.push((id, steps, outputs)),
            }
        }

        let mut stats = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        let mut rewriter = GraphRewriter::new(graph)?;
        for (id, steps, outputs) in plan {
            let (inputs, old_outputs) = match rewriter.node(id) {
                Some(node) => (node.inputs.clone(), node.outputs.clone()),
                None => continue,
            };
            let dangling =
                |reason: String| GraphInvariantError::MalformedFused { node: id, reason };
            let mut produced: Vec<ValueId> = Vec::with_capacity(steps.len());
            for lowered in steps {
                let args = lowered
                    .args
                    .iter()
                    .map(|arg| {
                        let value = match arg {
                            LoweredArg::Input(idx) => inputs.get(*idx),
                            LoweredArg::Step(idx) => produced.get(*idx),
                        };
                        value
                            .copied()
                            .ok_or_else(|| dangling(format!("lowered step refers to {arg:?}")))
                    })
                    .collect::<Result<Vec<ValueId>, _>>()?;
                let (_, values) = rewriter.insert_before(
                    id,
                    Operation::Export(lowered.op),
                    args,
                    BTreeMap::new(),
                    Vec::new(),
                )?;
                let value = values
                    .first()
                    .copied()
                    .ok_or_else(|| dangling("lowered step produced no value".to_string()))?;
                produced.push(value);
            }
            for (old, step_idx) in old_outputs.iter().zip(outputs) {
                let ty = rewriter.graph().value_type(*old).cloned();
                let new = *produced
                    .get(step_idx)
                    .ok_or_else(|| dangling(format!("output maps to missing step {step_idx}")))?;
                rewriter.set_value_type(new, ty);
                rewriter.replace_all_uses(*old, new);
            }
            rewriter.erase_node(id)?;
            stats.rewrites_applied += 1;
            stats.erased_nodes += 1;
            stats.changed = true;
        }
        Ok(stats)
    }
}

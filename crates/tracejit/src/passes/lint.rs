use std::collections::HashSet;

use crate::error::GraphInvariantError;
use crate::ir::{FusedArg, FusedSpec, Graph, NodeId, Operation, ValueDef, ValueId};

/// Validates structural invariants of `graph`:
///
/// - the order lists every live node exactly once and nothing else,
/// - every value is defined exactly once and before any use,
/// - value records agree with the nodes and inputs that define them,
/// - node arity matches the operator registry,
/// - fused chains only reference their own operands and earlier steps,
/// - every output is defined and there is at least one.
pub fn lint(graph: &Graph) -> Result<(), GraphInvariantError> {
    let mut listed: HashSet<NodeId> = HashSet::with_capacity(graph.num_nodes());
    for id in graph.order() {
        if !listed.insert(*id) {
            return Err(GraphInvariantError::NodeListedTwice { node: *id });
        }
        if graph.node(*id).is_none() {
            return Err(GraphInvariantError::MissingNode { node: *id });
        }
    }
    for (idx, slot) in graph.node_slots().iter().enumerate() {
        let id = NodeId(idx as u32);
        if slot.is_some() && !listed.contains(&id) {
            return Err(GraphInvariantError::UnorderedNode { node: id });
        }
    }

    let mut defined: HashSet<ValueId> = HashSet::new();
    for (index, value) in graph.inputs().iter().enumerate() {
        match graph.value(*value) {
            Some(record) if record.def == ValueDef::Input { index } => {}
            _ => return Err(GraphInvariantError::InputMismatch { index, value: *value }),
        }
        if !defined.insert(*value) {
            return Err(GraphInvariantError::DuplicateDefinition { value: *value });
        }
    }

    for (id, node) in graph.nodes() {
        let expected_inputs = node.op.num_inputs();
        if node.inputs.len() != expected_inputs {
            return Err(GraphInvariantError::ArityMismatch {
                node: id,
                op: node.op.name().to_string(),
                role: "inputs",
                expected: expected_inputs,
                actual: node.inputs.len(),
            });
        }
        let expected_outputs = node.op.num_outputs();
        if node.outputs.len() != expected_outputs {
            return Err(GraphInvariantError::ArityMismatch {
                node: id,
                op: node.op.name().to_string(),
                role: "outputs",
                expected: expected_outputs,
                actual: node.outputs.len(),
            });
        }
        if let Operation::Fused(spec) = &node.op {
            check_fused(id, spec)?;
        }
        for value in &node.inputs {
            if defined.contains(value) {
                continue;
            }
            return Err(if graph.value(*value).is_some() {
                GraphInvariantError::UseBeforeDef {
                    node: id,
                    value: *value,
                }
            } else {
                GraphInvariantError::DanglingValue {
                    node: id,
                    value: *value,
                }
            });
        }
        for (output, value) in node.outputs.iter().enumerate() {
            match graph.value(*value) {
                Some(record) if record.def == (ValueDef::Node { node: id, output }) => {}
                _ => return Err(GraphInvariantError::DefinitionMismatch { value: *value }),
            }
            if !defined.insert(*value) {
                return Err(GraphInvariantError::DuplicateDefinition { value: *value });
            }
        }
    }

    for (idx, slot) in graph.value_slots().iter().enumerate() {
        let value = ValueId(idx as u32);
        if slot.is_some() && !defined.contains(&value) {
            return Err(GraphInvariantError::DefinitionMismatch { value });
        }
    }

    if graph.outputs().is_empty() {
        return Err(GraphInvariantError::NoOutputs);
    }
    for value in graph.outputs() {
        if !defined.contains(value) {
            return Err(GraphInvariantError::UndefinedOutput { value: *value });
        }
    }
    Ok(())
}

/// Checks that every step of a fused chain has the arity of its operator and that each
/// argument names an operand below `num_inputs` or a strictly earlier step.
pub(crate) fn check_fused(node: NodeId, spec: &FusedSpec) -> Result<(), GraphInvariantError> {
    let malformed = |reason: String| GraphInvariantError::MalformedFused { node, reason };
    if spec.steps.is_empty() {
        return Err(malformed("chain has no steps".to_string()));
    }
    for (idx, step) in spec.steps.iter().enumerate() {
        let op = step.op.as_operation();
        if step.args.len() != op.num_inputs() {
            return Err(malformed(format!(
                "step {idx} ({}) takes {} arguments, found {}",
                op.name(),
                op.num_inputs(),
                step.args.len()
            )));
        }
        for arg in &step.args {
            let valid = match arg {
                FusedArg::Input(input) => *input < spec.num_inputs,
                FusedArg::Step(earlier) => *earlier < idx,
            };
            if !valid {
                return Err(malformed(format!("step {idx} refers to {arg:?}")));
            }
        }
    }
    Ok(())
}

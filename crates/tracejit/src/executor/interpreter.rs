use std::collections::HashMap;

use super::backend::{execute_fused, Backend};
use crate::error::{BackendError, Error, GraphInvariantError};
use crate::ir::{Graph, Operation, ValueId};

/// Walks `graph` node by node. Used when no optimized plan is available.
pub fn interpret<B: Backend + ?Sized>(
    backend: &B,
    graph: &Graph,
    inputs: &[B::Value],
) -> Result<Vec<B::Value>, Error> {
    if inputs.len() != graph.inputs().len() {
        return Err(BackendError::execution(format!(
            "graph expects {} inputs, received {}",
            graph.inputs().len(),
            inputs.len()
        ))
        .into());
    }
    let mut env: HashMap<ValueId, B::Value> = graph
        .inputs()
        .iter()
        .copied()
        .zip(inputs.iter().cloned())
        .collect();

    for (id, node) in graph.nodes() {
        let args = node
            .inputs
            .iter()
            .map(|value| {
                env.get(value)
                    .cloned()
                    .ok_or(GraphInvariantError::UseBeforeDef {
                        node: id,
                        value: *value,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let results = match &node.op {
            Operation::Fused(spec) => execute_fused(backend, spec, &args)?,
            _ => backend.execute_node(node, &args)?,
        };
        if results.len() != node.outputs.len() {
            return Err(BackendError::execution(format!(
                "`{}` returned {} values for {} outputs",
                node.op.name(),
                results.len(),
                node.outputs.len()
            ))
            .into());
        }
        env.extend(node.outputs.iter().copied().zip(results));
    }

    graph
        .outputs()
        .iter()
        .map(|value| {
            env.get(value)
                .cloned()
                .ok_or_else(|| GraphInvariantError::UndefinedOutput { value: *value }.into())
        })
        .collect()
}

use std::collections::HashMap;

use super::backend::{fused_kernels, run_fused_kernels, Backend, FusedKernel};
use crate::error::{BackendError, BackendResult, GraphInvariantError};
use crate::ir::{Graph, Node, Operation, ValueId};

#[derive(Debug, Clone)]
enum Kernel {
    Node(Node),
    Fused(Vec<FusedKernel>),
}

#[derive(Debug, Clone)]
struct PlanStep {
    kernel: Kernel,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

/// Slot-indexed replay of an optimized graph.
///
/// Compiling resolves every value to a slot once, so replay does no map lookups.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    num_slots: usize,
    num_inputs: usize,
    steps: Vec<PlanStep>,
    outputs: Vec<usize>,
}

impl ExecutionPlan {
    pub fn compile(graph: &Graph) -> Result<Self, GraphInvariantError> {
        let mut slots: HashMap<ValueId, usize> = HashMap::new();
        for value in graph.inputs() {
            let next = slots.len();
            slots.insert(*value, next);
        }

        let mut steps = Vec::with_capacity(graph.num_nodes());
        for (id, node) in graph.nodes() {
            let inputs = node
                .inputs
                .iter()
                .map(|value| {
                    slots
                        .get(value)
                        .copied()
                        .ok_or(GraphInvariantError::UseBeforeDef {
                            node: id,
                            value: *value,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = node
                .outputs
                .iter()
                .map(|value| {
                    let next = slots.len();
                    *slots.entry(*value).or_insert(next)
                })
                .collect();
            let kernel = match &node.op {
                Operation::Fused(spec) => Kernel::Fused(fused_kernels(spec)),
                _ => Kernel::Node(node.clone()),
            };
            steps.push(PlanStep {
                kernel,
                inputs,
                outputs,
            });
        }

        let outputs = graph
            .outputs()
            .iter()
            .map(|value| {
                slots
                    .get(value)
                    .copied()
                    .ok_or(GraphInvariantError::UndefinedOutput { value: *value })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            num_slots: slots.len(),
            num_inputs: graph.inputs().len(),
            steps,
            outputs,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn execute<B: Backend + ?Sized>(
        &self,
        backend: &B,
        inputs: &[B::Value],
    ) -> BackendResult<Vec<B::Value>> {
        if inputs.len() != self.num_inputs {
            return Err(BackendError::execution(format!(
                "plan expects {} inputs, received {}",
                self.num_inputs,
                inputs.len()
            )));
        }
        let mut slots: Vec<Option<B::Value>> = vec![None; self.num_slots];
        for (slot, value) in slots.iter_mut().zip(inputs) {
            *slot = Some(value.clone());
        }

        for step in &self.steps {
            let args = step
                .inputs
                .iter()
                .map(|slot| {
                    slots[*slot]
                        .clone()
                        .ok_or_else(|| BackendError::execution(format!("slot {slot} is empty")))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            let results = match &step.kernel {
                Kernel::Node(node) => backend.execute_node(node, &args)?,
                Kernel::Fused(kernels) => run_fused_kernels(backend, kernels, &args)?,
            };
            if results.len() != step.outputs.len() {
                return Err(BackendError::execution(format!(
                    "kernel returned {} values for {} outputs",
                    results.len(),
                    step.outputs.len()
                )));
            }
            for (slot, value) in step.outputs.iter().zip(results) {
                slots[*slot] = Some(value);
            }
        }

        self.outputs
            .iter()
            .map(|slot| {
                slots[*slot]
                    .clone()
                    .ok_or_else(|| BackendError::execution(format!("output slot {slot} is empty")))
            })
            .collect()
    }
}

use std::sync::Arc;

use crate::error::{BackendError, BackendResult};
use crate::ir::{FusedArg, FusedSpec, Node, TensorSpec, ValueId};
use crate::passes::FusionPolicy;

/// Numeric collaborator that executes individual nodes.
///
/// Implementations see nodes with internal operators, and with exchange operators when
/// lowering is enabled. [`Operation::Fused`](crate::ir::Operation::Fused) nodes are
/// evaluated by the executor step by step and never reach `execute_node` through it.
pub trait Backend: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    fn backend_name(&self) -> &str;

    /// Runs one node. Must return exactly one value per node output.
    fn execute_node(&self, node: &Node, inputs: &[Self::Value]) -> BackendResult<Vec<Self::Value>>;

    /// Static type of a value, recorded on graph inputs while tracing.
    fn type_of(&self, _value: &Self::Value) -> Option<TensorSpec> {
        None
    }

    /// Legality predicate for elementwise fusion. `None` disables fusion.
    fn fusion_policy(&self) -> Option<Arc<dyn FusionPolicy>> {
        None
    }
}

/// Pre-built node for one step of a fused chain.
#[derive(Debug, Clone)]
pub(crate) struct FusedKernel {
    pub(crate) node: Node,
    pub(crate) args: Vec<FusedArg>,
}

pub(crate) fn fused_kernels(spec: &FusedSpec) -> Vec<FusedKernel> {
    spec.steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let inputs = (0..step.args.len()).map(|arg| ValueId(arg as u32)).collect();
            FusedKernel {
                node: Node::detached(step.op.as_operation(), inputs, vec![ValueId(idx as u32)]),
                args: step.args.clone(),
            }
        })
        .collect()
}

pub(crate) fn run_fused_kernels<B: Backend + ?Sized>(
    backend: &B,
    kernels: &[FusedKernel],
    inputs: &[B::Value],
) -> BackendResult<Vec<B::Value>> {
    let mut results: Vec<B::Value> = Vec::with_capacity(kernels.len());
    for kernel in kernels {
        let mut args = Vec::with_capacity(kernel.args.len());
        for arg in &kernel.args {
            let value = match arg {
                FusedArg::Input(idx) => inputs.get(*idx),
                FusedArg::Step(idx) => results.get(*idx),
            };
            let value = value.ok_or_else(|| {
                BackendError::execution(format!("fused step refers to missing operand {arg:?}"))
            })?;
            args.push(value.clone());
        }
        let mut outputs = backend.execute_node(&kernel.node, &args)?;
        if outputs.len() != 1 {
            return Err(BackendError::execution(format!(
                "fused step `{}` produced {} values",
                kernel.node.op.name(),
                outputs.len()
            )));
        }
        results.extend(outputs.drain(..));
    }
    results
        .pop()
        .map(|last| vec![last])
        .ok_or_else(|| BackendError::execution("fused node has no steps"))
}

/// Evaluates a fused chain one step at a time through `backend`.
///
/// Backends that receive a fused node directly can delegate here.
pub fn execute_fused<B: Backend + ?Sized>(
    backend: &B,
    spec: &FusedSpec,
    inputs: &[B::Value],
) -> BackendResult<Vec<B::Value>> {
    run_fused_kernels(backend, &fused_kernels(spec), inputs)
}

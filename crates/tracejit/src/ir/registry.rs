use once_cell::sync::Lazy;

use super::spec::Operation;

/// Fieldless mirror of [`Operation`], used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Constant,
    Unary,
    Binary,
    SinCos,
    MatMul,
    Transpose,
    ReduceSum,
    Print,
    RngUniform,
    Fused,
    Export,
}

impl OpKind {
    pub const ALL: [OpKind; 11] = [
        OpKind::Constant,
        OpKind::Unary,
        OpKind::Binary,
        OpKind::SinCos,
        OpKind::MatMul,
        OpKind::Transpose,
        OpKind::ReduceSum,
        OpKind::Print,
        OpKind::RngUniform,
        OpKind::Fused,
        OpKind::Export,
    ];

    pub fn from_op(op: &Operation) -> Self {
        match op {
            Operation::Constant(_) => OpKind::Constant,
            Operation::Unary(_) => OpKind::Unary,
            Operation::Binary(_) => OpKind::Binary,
            Operation::SinCos => OpKind::SinCos,
            Operation::MatMul => OpKind::MatMul,
            Operation::Transpose => OpKind::Transpose,
            Operation::ReduceSum { .. } => OpKind::ReduceSum,
            Operation::Print => OpKind::Print,
            Operation::RngUniform { .. } => OpKind::RngUniform,
            Operation::Fused(_) => OpKind::Fused,
            Operation::Export(_) => OpKind::Export,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purity {
    Pure,
    SideEffecting,
    /// Depends on the payload (exchange ops).
    PerInstance,
}

/// Static facts about an operator kind.
///
/// `num_inputs` is meaningless for [`OpKind::Fused`] and [`OpKind::Export`]; their arity
/// lives in the payload and is reported by [`Operation::num_inputs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSignature {
    pub kind: OpKind,
    pub name: &'static str,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub purity: Purity,
    pub elementwise: bool,
}

const fn sig(
    kind: OpKind,
    name: &'static str,
    num_inputs: usize,
    num_outputs: usize,
    purity: Purity,
    elementwise: bool,
) -> OpSignature {
    OpSignature {
        kind,
        name,
        num_inputs,
        num_outputs,
        purity,
        elementwise,
    }
}

pub fn signature(kind: OpKind) -> OpSignature {
    use Purity::*;
    match kind {
        OpKind::Constant => sig(kind, "constant", 0, 1, Pure, false),
        OpKind::Unary => sig(kind, "unary", 1, 1, Pure, true),
        OpKind::Binary => sig(kind, "binary", 2, 1, Pure, true),
        OpKind::SinCos => sig(kind, "sincos", 1, 2, Pure, true),
        OpKind::MatMul => sig(kind, "matmul", 2, 1, Pure, false),
        OpKind::Transpose => sig(kind, "transpose", 1, 1, Pure, false),
        OpKind::ReduceSum => sig(kind, "reduce_sum", 1, 1, Pure, false),
        OpKind::Print => sig(kind, "print", 1, 1, SideEffecting, false),
        OpKind::RngUniform => sig(kind, "rng_uniform", 0, 1, SideEffecting, false),
        OpKind::Fused => sig(kind, "fused", 0, 1, Pure, true),
        OpKind::Export => sig(kind, "export", 0, 1, PerInstance, false),
    }
}

static REGISTRY: Lazy<Vec<OpSignature>> =
    Lazy::new(|| OpKind::ALL.iter().map(|kind| signature(*kind)).collect());

/// Every known operator signature, in declaration order.
pub fn registry() -> &'static [OpSignature] {
    &REGISTRY
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// SSA value identifier, unique within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Stable node identifier. Survives insertion and removal of other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Element types a backend may report for its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I64,
    Bool,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

/// Static type of a value. An empty `dims` is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            dims: dims.into(),
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[", self.dtype)?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Constant payload embedded in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Scalar(f64),
    Dense { dims: Vec<usize>, data: Vec<f64> },
}

impl Literal {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Literal::Scalar(value) => Some(*value),
            Literal::Dense { .. } => None,
        }
    }

    pub fn spec(&self) -> TensorSpec {
        match self {
            Literal::Scalar(_) => TensorSpec::scalar(DType::F64),
            Literal::Dense { dims, .. } => TensorSpec::new(DType::F64, dims.clone()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Scalar(value) => write!(f, "{value}"),
            Literal::Dense { dims, data } => write!(f, "dense{dims:?}{data:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Tanh,
    Sigmoid,
    Relu,
    Reciprocal,
    Square,
    Sin,
    Cos,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Relu => "relu",
            UnaryOp::Reciprocal => "reciprocal",
            UnaryOp::Square => "square",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
        }
    }

    /// Returns `true` when `self(inner(x))` is bitwise `x` for every `f64`.
    ///
    /// `log(exp(x))` and `1/(1/x)` are not listed: overflow, underflow and subnormals
    /// make them differ from `x`.
    pub fn cancels(self, inner: UnaryOp) -> bool {
        matches!((self, inner), (UnaryOp::Neg, UnaryOp::Neg))
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Rsqrt => 1.0 / x.sqrt(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Reciprocal => 1.0 / x,
            UnaryOp::Square => x * x,
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::Max | BinaryOp::Min
        )
    }

    /// Scalar `c` such that `op(x, c)` is bitwise `x`, signed zeros included.
    pub fn right_identity(self) -> Option<f64> {
        match self {
            BinaryOp::Add => Some(-0.0),
            BinaryOp::Sub => Some(0.0),
            BinaryOp::Mul | BinaryOp::Div => Some(1.0),
            // `powf` comes from the platform libm, which need not return `x` exactly.
            BinaryOp::Pow | BinaryOp::Max | BinaryOp::Min => None,
        }
    }

    /// Scalar `c` such that `op(c, x)` is bitwise `x`.
    pub fn left_identity(self) -> Option<f64> {
        match self {
            BinaryOp::Add => Some(-0.0),
            BinaryOp::Mul => Some(1.0),
            _ => None,
        }
    }

    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Pow => lhs.powf(rhs),
            // `f64::max` leaves the sign of `max(-0.0, 0.0)` unspecified; resolve it so
            // swapping operands never changes the result.
            BinaryOp::Max if lhs == rhs => f64::from_bits(lhs.to_bits() & rhs.to_bits()),
            BinaryOp::Min if lhs == rhs => f64::from_bits(lhs.to_bits() | rhs.to_bits()),
            BinaryOp::Max => lhs.max(rhs),
            BinaryOp::Min => lhs.min(rhs),
        }
    }
}

/// Operator allowed inside a fused chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusedOp {
    Unary(UnaryOp),
    Binary(BinaryOp),
}

impl FusedOp {
    pub fn as_operation(self) -> Operation {
        match self {
            FusedOp::Unary(op) => Operation::Unary(op),
            FusedOp::Binary(op) => Operation::Binary(op),
        }
    }

    pub fn from_operation(op: &Operation) -> Option<Self> {
        match op {
            Operation::Unary(op) => Some(FusedOp::Unary(*op)),
            Operation::Binary(op) => Some(FusedOp::Binary(*op)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusedArg {
    /// Operand `i` of the fused node.
    Input(usize),
    /// Result of an earlier step in the same chain.
    Step(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FusedStep {
    pub op: FusedOp,
    pub args: Vec<FusedArg>,
}

/// Chain of elementwise steps collapsed into one node. The last step is the node's result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FusedSpec {
    pub num_inputs: usize,
    pub steps: Vec<FusedStep>,
}

/// Exchange operator set produced by lowering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExportOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Tanh,
    Sigmoid,
    Relu,
    Reciprocal,
    Sin,
    Cos,
    MatMul,
    Transpose,
    ReduceSum { axis: Option<usize> },
    Constant(Literal),
    Identity,
    RandomUniform { shape: Vec<usize> },
}

impl ExportOp {
    pub fn name(&self) -> &'static str {
        match self {
            ExportOp::Add => "Add",
            ExportOp::Sub => "Sub",
            ExportOp::Mul => "Mul",
            ExportOp::Div => "Div",
            ExportOp::Pow => "Pow",
            ExportOp::Max => "Max",
            ExportOp::Min => "Min",
            ExportOp::Neg => "Neg",
            ExportOp::Abs => "Abs",
            ExportOp::Exp => "Exp",
            ExportOp::Log => "Log",
            ExportOp::Sqrt => "Sqrt",
            ExportOp::Tanh => "Tanh",
            ExportOp::Sigmoid => "Sigmoid",
            ExportOp::Relu => "Relu",
            ExportOp::Reciprocal => "Reciprocal",
            ExportOp::Sin => "Sin",
            ExportOp::Cos => "Cos",
            ExportOp::MatMul => "MatMul",
            ExportOp::Transpose => "Transpose",
            ExportOp::ReduceSum { .. } => "ReduceSum",
            ExportOp::Constant(_) => "Constant",
            ExportOp::Identity => "Identity",
            ExportOp::RandomUniform { .. } => "RandomUniform",
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            ExportOp::Constant(_) | ExportOp::RandomUniform { .. } => 0,
            ExportOp::Add
            | ExportOp::Sub
            | ExportOp::Mul
            | ExportOp::Div
            | ExportOp::Pow
            | ExportOp::Max
            | ExportOp::Min
            | ExportOp::MatMul => 2,
            _ => 1,
        }
    }

    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            ExportOp::Add | ExportOp::Mul | ExportOp::Max | ExportOp::Min
        )
    }

    /// Matching exchange operator for an elementwise unary op, when one exists 1:1.
    pub fn from_unary(op: UnaryOp) -> Option<Self> {
        Some(match op {
            UnaryOp::Neg => ExportOp::Neg,
            UnaryOp::Abs => ExportOp::Abs,
            UnaryOp::Exp => ExportOp::Exp,
            UnaryOp::Log => ExportOp::Log,
            UnaryOp::Sqrt => ExportOp::Sqrt,
            UnaryOp::Tanh => ExportOp::Tanh,
            UnaryOp::Sigmoid => ExportOp::Sigmoid,
            UnaryOp::Relu => ExportOp::Relu,
            UnaryOp::Reciprocal => ExportOp::Reciprocal,
            UnaryOp::Sin => ExportOp::Sin,
            UnaryOp::Cos => ExportOp::Cos,
            UnaryOp::Rsqrt | UnaryOp::Square => return None,
        })
    }

    pub fn from_binary(op: BinaryOp) -> Self {
        match op {
            BinaryOp::Add => ExportOp::Add,
            BinaryOp::Sub => ExportOp::Sub,
            BinaryOp::Mul => ExportOp::Mul,
            BinaryOp::Div => ExportOp::Div,
            BinaryOp::Pow => ExportOp::Pow,
            BinaryOp::Max => ExportOp::Max,
            BinaryOp::Min => ExportOp::Min,
        }
    }
}

/// Operator tag carried by every node.
///
/// Internal operators are everything except [`Operation::Export`], which only appears
/// after the lowering pass has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(Literal),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// One input, two outputs: `(sin x, cos x)`.
    SinCos,
    MatMul,
    Transpose,
    ReduceSum { axis: Option<usize> },
    /// Emits its input to the backend's output channel and passes it through.
    Print,
    RngUniform { shape: Vec<usize> },
    Fused(FusedSpec),
    Export(ExportOp),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::Unary(op) => op.name(),
            Operation::Binary(op) => op.name(),
            Operation::SinCos => "sincos",
            Operation::MatMul => "matmul",
            Operation::Transpose => "transpose",
            Operation::ReduceSum { .. } => "reduce_sum",
            Operation::Print => "print",
            Operation::RngUniform { .. } => "rng_uniform",
            Operation::Fused(_) => "fused",
            Operation::Export(op) => op.name(),
        }
    }

    /// Side-effecting nodes are never removed, merged or reordered past each other.
    pub fn is_side_effecting(&self) -> bool {
        matches!(
            self,
            Operation::Print
                | Operation::RngUniform { .. }
                | Operation::Export(ExportOp::RandomUniform { .. })
        )
    }

    pub fn is_pure(&self) -> bool {
        !self.is_side_effecting()
    }

    pub fn is_export(&self) -> bool {
        matches!(self, Operation::Export(_))
    }

    /// Number of inputs the operator requires.
    pub fn num_inputs(&self) -> usize {
        match self {
            Operation::Fused(spec) => spec.num_inputs,
            Operation::Export(op) => op.num_inputs(),
            other => super::registry::signature(other.kind()).num_inputs,
        }
    }

    pub fn num_outputs(&self) -> usize {
        super::registry::signature(self.kind()).num_outputs
    }

    pub fn kind(&self) -> super::registry::OpKind {
        super::registry::OpKind::from_op(self)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Constant(literal) => write!(f, "constant[{literal}]"),
            Operation::ReduceSum { axis: Some(axis) } => write!(f, "reduce_sum[axis={axis}]"),
            Operation::RngUniform { shape } => write!(f, "rng_uniform{shape:?}"),
            Operation::Fused(spec) => {
                write!(f, "fused[")?;
                for (idx, step) in spec.steps.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{}", step.op.as_operation().name())?;
                }
                write!(f, "]")
            }
            Operation::Export(ExportOp::Constant(literal)) => {
                write!(f, "export.Constant[{literal}]")
            }
            Operation::Export(ExportOp::ReduceSum { axis: Some(axis) }) => {
                write!(f, "export.ReduceSum[axis={axis}]")
            }
            Operation::Export(ExportOp::RandomUniform { shape }) => {
                write!(f, "export.RandomUniform{shape:?}")
            }
            Operation::Export(op) => write!(f, "export.{}", op.name()),
            other => f.write_str(other.name()),
        }
    }
}

/// Free-form attribute attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    I64List(Vec<i64>),
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attr::Bool(value) => write!(f, "{value}"),
            Attr::I64(value) => write!(f, "{value}"),
            Attr::F64(value) => write!(f, "{value}"),
            Attr::Str(value) => write!(f, "{value:?}"),
            Attr::I64List(values) => write!(f, "{values:?}"),
        }
    }
}

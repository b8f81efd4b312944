use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use super::state::TracingState;
use crate::error::TraceError;
use crate::ir::{BinaryOp, Operation, TensorSpec, UnaryOp, ValueId};

type Result<T> = std::result::Result<T, TraceError>;

/// Proxy for a value recorded by a [`TracingState`].
///
/// Every operation on a proxy appends a node to the session's graph. The `try_*` forms
/// report misuse as [`TraceError`]; the plain forms panic, which keeps traced callbacks
/// readable when they are written with operators.
#[derive(Clone, Copy)]
pub struct Traced<'s> {
    state: &'s TracingState,
    value: ValueId,
}

impl fmt::Debug for Traced<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Traced({})", self.value)
    }
}

/// `try_name / name => Op` generates both forms. Operators that `std::ops` already
/// covers list only the `try_` form.
macro_rules! unary_methods {
    ($($try_name:ident $(/ $name:ident)? => $op:ident),* $(,)?) => {
        $(
            pub fn $try_name(self) -> Result<Self> {
                self.try_unary(UnaryOp::$op)
            }

            $(
                pub fn $name(self) -> Self {
                    Self::unwrap(self.$try_name(), UnaryOp::$op.name())
                }
            )?
        )*
    };
}

macro_rules! binary_methods {
    ($($try_name:ident $(/ $name:ident)? => $op:ident),* $(,)?) => {
        $(
            pub fn $try_name(self, rhs: Traced<'s>) -> Result<Self> {
                self.try_binary(BinaryOp::$op, rhs)
            }

            $(
                pub fn $name(self, rhs: Traced<'s>) -> Self {
                    Self::unwrap(self.$try_name(rhs), BinaryOp::$op.name())
                }
            )?
        )*
    };
}

impl<'s> Traced<'s> {
    pub(crate) fn new(state: &'s TracingState, value: ValueId) -> Self {
        Self { state, value }
    }

    pub fn value(&self) -> ValueId {
        self.value
    }

    pub fn state(&self) -> &'s TracingState {
        self.state
    }

    pub fn spec(&self) -> Option<TensorSpec> {
        self.state.value_type(self.value)
    }

    fn unwrap<T>(result: Result<T>, op: &str) -> T {
        result.unwrap_or_else(|err| panic!("traced {op} failed: {err}"))
    }

    fn ensure_same_session(&self, other: &Traced<'_>) -> Result<()> {
        if std::ptr::eq(self.state, other.state) {
            Ok(())
        } else {
            Err(TraceError::ForeignValue { value: other.value })
        }
    }

    pub fn try_unary(self, op: UnaryOp) -> Result<Self> {
        self.state.record_one(Operation::Unary(op), &[self.value])
    }

    pub fn try_binary(self, op: BinaryOp, rhs: Traced<'s>) -> Result<Self> {
        self.ensure_same_session(&rhs)?;
        self.state
            .record_one(Operation::Binary(op), &[self.value, rhs.value])
    }

    fn try_binary_scalar(self, op: BinaryOp, scalar: f64) -> Result<Self> {
        let rhs = self.state.try_scalar(scalar)?;
        self.try_binary(op, rhs)
    }

    fn try_scalar_binary(self, scalar: f64, op: BinaryOp) -> Result<Self> {
        let lhs = self.state.try_scalar(scalar)?;
        lhs.try_binary(op, self)
    }

    unary_methods! {
        try_neg => Neg,
        try_abs / abs => Abs,
        try_exp / exp => Exp,
        try_log / log => Log,
        try_sqrt / sqrt => Sqrt,
        try_rsqrt / rsqrt => Rsqrt,
        try_tanh / tanh => Tanh,
        try_sigmoid / sigmoid => Sigmoid,
        try_relu / relu => Relu,
        try_reciprocal / reciprocal => Reciprocal,
        try_square / square => Square,
        try_sin / sin => Sin,
        try_cos / cos => Cos,
    }

    binary_methods! {
        try_add => Add,
        try_sub => Sub,
        try_mul => Mul,
        try_div => Div,
        try_pow / pow => Pow,
        try_maximum / maximum => Max,
        try_minimum / minimum => Min,
    }

    pub fn try_powf(self, exponent: f64) -> Result<Self> {
        self.try_binary_scalar(BinaryOp::Pow, exponent)
    }

    pub fn powf(self, exponent: f64) -> Self {
        Self::unwrap(self.try_powf(exponent), "pow")
    }

    /// Records one node with two outputs.
    pub fn try_sin_cos(self) -> Result<(Self, Self)> {
        let outputs = self
            .state
            .record(Operation::SinCos, &[self.value], Default::default())?;
        match outputs.as_slice() {
            [sin, cos] => Ok((Traced::new(self.state, *sin), Traced::new(self.state, *cos))),
            _ => Err(TraceError::Arity {
                op: "sincos".to_string(),
                expected: 2,
                actual: outputs.len(),
            }),
        }
    }

    pub fn sin_cos(self) -> (Self, Self) {
        Self::unwrap(self.try_sin_cos(), "sincos")
    }

    pub fn try_matmul(self, rhs: Traced<'s>) -> Result<Self> {
        self.ensure_same_session(&rhs)?;
        self.state
            .record_one(Operation::MatMul, &[self.value, rhs.value])
    }

    pub fn matmul(self, rhs: Traced<'s>) -> Self {
        Self::unwrap(self.try_matmul(rhs), "matmul")
    }

    pub fn try_transpose(self) -> Result<Self> {
        self.state.record_one(Operation::Transpose, &[self.value])
    }

    pub fn transpose(self) -> Self {
        Self::unwrap(self.try_transpose(), "transpose")
    }

    /// Sums along `axis`, or over every element when `axis` is `None`.
    pub fn try_sum(self, axis: Option<usize>) -> Result<Self> {
        self.state
            .record_one(Operation::ReduceSum { axis }, &[self.value])
    }

    pub fn sum(self, axis: Option<usize>) -> Self {
        Self::unwrap(self.try_sum(axis), "reduce_sum")
    }

    /// Records a side-effecting print and returns the passed-through value.
    pub fn try_print(self) -> Result<Self> {
        self.state.record_one(Operation::Print, &[self.value])
    }

    pub fn print(self) -> Self {
        Self::unwrap(self.try_print(), "print")
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:ident) => {
        impl<'s> $trait<Traced<'s>> for Traced<'s> {
            type Output = Traced<'s>;

            fn $method(self, rhs: Traced<'s>) -> Self::Output {
                Traced::unwrap(self.try_binary(BinaryOp::$op, rhs), BinaryOp::$op.name())
            }
        }

        impl<'s> $trait<f64> for Traced<'s> {
            type Output = Traced<'s>;

            fn $method(self, rhs: f64) -> Self::Output {
                Traced::unwrap(
                    self.try_binary_scalar(BinaryOp::$op, rhs),
                    BinaryOp::$op.name(),
                )
            }
        }

        impl<'s> $trait<Traced<'s>> for f64 {
            type Output = Traced<'s>;

            fn $method(self, rhs: Traced<'s>) -> Self::Output {
                Traced::unwrap(
                    rhs.try_scalar_binary(self, BinaryOp::$op),
                    BinaryOp::$op.name(),
                )
            }
        }
    };
}

impl_binary_operator!(Add, add, Add);
impl_binary_operator!(Sub, sub, Sub);
impl_binary_operator!(Mul, mul, Mul);
impl_binary_operator!(Div, div, Div);

impl<'s> Neg for Traced<'s> {
    type Output = Traced<'s>;

    fn neg(self) -> Self::Output {
        Traced::unwrap(self.try_unary(UnaryOp::Neg), "neg")
    }
}

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use super::traced::Traced;
use crate::error::{GraphInvariantError, TraceError, TraceIdentityError};
use crate::ir::{Attr, DType, Graph, Literal, Operation, TensorSpec, ValueId};

/// Seed for one graph input.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceInput<V> {
    /// A real backend value; only its type is recorded.
    Concrete(V),
    /// A value that will be bound later, such as a capture.
    Placeholder(Option<TensorSpec>),
}

/// What a traced callback hands back.
#[derive(Debug, Clone)]
pub enum TraceOutput<'s, V> {
    Traced(Traced<'s>),
    /// A value computed outside the trace. Always rejected.
    Concrete(V),
}

impl<'s, V> From<Traced<'s>> for TraceOutput<'s, V> {
    fn from(value: Traced<'s>) -> Self {
        TraceOutput::Traced(value)
    }
}

/// Recording session. Lives for exactly one trace and is single-threaded.
pub struct TracingState {
    graph: RefCell<Graph>,
    num_ordinary: usize,
    seeded: Vec<ValueId>,
    exited: Cell<bool>,
}

/// Opens a session and seeds one graph input per entry of `inputs`.
///
/// The first `num_ordinary` inputs are call arguments; the rest are captures.
pub fn enter<V>(
    inputs: &[TraceInput<V>],
    num_ordinary: usize,
    type_of: impl Fn(&V) -> Option<TensorSpec>,
) -> Result<(TracingState, Vec<ValueId>), TraceError> {
    if num_ordinary > inputs.len() {
        return Err(TraceError::TooManyOrdinary {
            num_ordinary,
            total: inputs.len(),
        });
    }
    let mut graph = Graph::new("traced");
    let mut seeded = Vec::with_capacity(inputs.len());
    for input in inputs {
        let ty = match input {
            TraceInput::Concrete(value) => type_of(value),
            TraceInput::Placeholder(ty) => ty.clone(),
        };
        seeded.push(graph.add_input(ty)?);
    }
    log::trace!(
        "trace session opened with {} ordinary inputs and {} captures",
        num_ordinary,
        inputs.len() - num_ordinary
    );
    let state = TracingState {
        graph: RefCell::new(graph),
        num_ordinary,
        seeded: seeded.clone(),
        exited: Cell::new(false),
    };
    Ok((state, seeded))
}

impl TracingState {
    pub fn num_ordinary(&self) -> usize {
        self.num_ordinary
    }

    pub fn num_captures(&self) -> usize {
        self.seeded.len() - self.num_ordinary
    }

    pub fn is_recording(&self) -> bool {
        !self.exited.get()
    }

    /// Proxies for the ordinary inputs, in order.
    pub fn inputs(&self) -> Vec<Traced<'_>> {
        self.seeded[..self.num_ordinary]
            .iter()
            .map(|value| Traced::new(self, *value))
            .collect()
    }

    /// Proxy for capture `index`, the same value that was seeded for it at entry.
    pub fn capture(&self, index: usize) -> Result<Traced<'_>, TraceError> {
        let count = self.num_captures();
        self.seeded
            .get(self.num_ordinary + index)
            .map(|value| Traced::new(self, *value))
            .ok_or(TraceError::CaptureIndex { index, count })
    }

    pub fn owns(&self, traced: &Traced<'_>) -> bool {
        std::ptr::eq(traced.state(), self)
    }

    pub fn value_type(&self, value: ValueId) -> Option<TensorSpec> {
        self.graph.borrow().value_type(value).cloned()
    }

    /// Appends a node and returns its outputs.
    pub fn record(
        &self,
        op: Operation,
        inputs: &[ValueId],
        attrs: BTreeMap<String, Attr>,
    ) -> Result<Vec<ValueId>, TraceError> {
        if self.exited.get() {
            return Err(TraceError::Exited);
        }
        let expected = op.num_inputs();
        if inputs.len() != expected {
            return Err(TraceError::Arity {
                op: op.name().to_string(),
                expected,
                actual: inputs.len(),
            });
        }
        let mut graph = self.graph.borrow_mut();
        for value in inputs {
            if graph.value(*value).is_none() {
                return Err(TraceError::UnknownValue { value: *value });
            }
        }
        let types = infer_output_types(&graph, &op, inputs);
        let node = graph.push_node(op, inputs.to_vec(), attrs, types)?;
        Ok(graph
            .node(node)
            .map(|node| node.outputs.clone())
            .unwrap_or_default())
    }

    pub(crate) fn record_one(
        &self,
        op: Operation,
        inputs: &[ValueId],
    ) -> Result<Traced<'_>, TraceError> {
        let outputs = self.record(op, inputs, BTreeMap::new())?;
        outputs
            .first()
            .map(|value| Traced::new(self, *value))
            .ok_or(TraceError::Graph(GraphInvariantError::NoOutputs))
    }

    pub fn try_constant(&self, literal: Literal) -> Result<Traced<'_>, TraceError> {
        self.record_one(Operation::Constant(literal), &[])
    }

    pub fn try_scalar(&self, value: f64) -> Result<Traced<'_>, TraceError> {
        self.try_constant(Literal::Scalar(value))
    }

    pub fn scalar(&self, value: f64) -> Traced<'_> {
        self.try_scalar(value)
            .unwrap_or_else(|err| panic!("traced scalar failed: {err}"))
    }

    pub fn try_rng_uniform(&self, shape: Vec<usize>) -> Result<Traced<'_>, TraceError> {
        self.record_one(Operation::RngUniform { shape }, &[])
    }

    /// Checks that every returned item is a proxy recorded by this session.
    pub fn resolve_outputs<V>(
        &self,
        outputs: Vec<TraceOutput<'_, V>>,
    ) -> Result<Vec<ValueId>, TraceIdentityError> {
        if outputs.is_empty() {
            return Err(TraceIdentityError::NoOutputs);
        }
        let graph = self.graph.borrow();
        outputs
            .into_iter()
            .enumerate()
            .map(|(index, output)| match output {
                TraceOutput::Concrete(_) => Err(TraceIdentityError::Untraced { index }),
                TraceOutput::Traced(traced) if !self.owns(&traced) => {
                    Err(TraceIdentityError::ForeignSession { index })
                }
                TraceOutput::Traced(traced) => {
                    let value = traced.value();
                    if graph.value(value).is_some() {
                        Ok(value)
                    } else {
                        Err(TraceIdentityError::UnknownValue { index, value })
                    }
                }
            })
            .collect()
    }

    /// Marks `outputs` as the graph results and freezes the graph.
    pub fn exit(&self, outputs: &[Traced<'_>]) -> Result<(), TraceError> {
        if self.exited.get() {
            return Err(TraceError::Exited);
        }
        let mut values = Vec::with_capacity(outputs.len());
        for output in outputs {
            if !self.owns(output) {
                return Err(TraceError::ForeignValue {
                    value: output.value(),
                });
            }
            values.push(output.value());
        }
        self.exit_values(values)
    }

    pub(crate) fn exit_values(&self, values: Vec<ValueId>) -> Result<(), TraceError> {
        let mut graph = self.graph.borrow_mut();
        graph.set_outputs(values)?;
        graph.freeze();
        self.exited.set(true);
        log::trace!("trace session closed with {} nodes", graph.num_nodes());
        Ok(())
    }

    /// Consumes the session and returns the frozen graph.
    pub fn into_graph(self) -> Result<Graph, TraceError> {
        if !self.exited.get() {
            return Err(TraceError::NotExited);
        }
        Ok(self.graph.into_inner())
    }

    /// Copy of the graph recorded so far.
    pub fn snapshot(&self) -> Graph {
        self.graph.borrow().clone()
    }
}

fn broadcast(lhs: Option<&TensorSpec>, rhs: Option<&TensorSpec>) -> Option<TensorSpec> {
    let (lhs, rhs) = (lhs?, rhs?);
    if lhs == rhs || rhs.rank() == 0 {
        Some(lhs.clone())
    } else if lhs.rank() == 0 {
        Some(rhs.clone())
    } else {
        None
    }
}

fn infer_output_types(graph: &Graph, op: &Operation, inputs: &[ValueId]) -> Vec<Option<TensorSpec>> {
    let ty = |idx: usize| inputs.get(idx).and_then(|value| graph.value_type(*value));
    match op {
        Operation::Constant(literal) => vec![Some(literal.spec())],
        Operation::Unary(_) | Operation::Print => vec![ty(0).cloned()],
        Operation::Binary(_) => vec![broadcast(ty(0), ty(1))],
        Operation::SinCos => vec![ty(0).cloned(), ty(0).cloned()],
        Operation::MatMul => {
            let out = match (ty(0), ty(1)) {
                (Some(a), Some(b)) if a.rank() == 2 && b.rank() == 2 && a.dims[1] == b.dims[0] => {
                    Some(TensorSpec::new(a.dtype, vec![a.dims[0], b.dims[1]]))
                }
                _ => None,
            };
            vec![out]
        }
        Operation::Transpose => vec![ty(0).map(|spec| {
            let mut dims = spec.dims.clone();
            dims.reverse();
            TensorSpec::new(spec.dtype, dims)
        })],
        Operation::ReduceSum { axis } => vec![ty(0).and_then(|spec| match axis {
            None => Some(TensorSpec::scalar(spec.dtype)),
            Some(axis) if *axis < spec.rank() => {
                let mut dims = spec.dims.clone();
                dims.remove(*axis);
                Some(TensorSpec::new(spec.dtype, dims))
            }
            Some(_) => None,
        })],
        Operation::RngUniform { shape } => {
            vec![Some(TensorSpec::new(DType::F64, shape.clone()))]
        }
        Operation::Fused(_) | Operation::Export(_) => vec![None],
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracejit::error::{BackendError, BackendResult};
use tracejit::executor::{execute_fused, Backend};
use tracejit::ir::{
    BinaryOp, DType, ExportOp, Graph, Literal, Node, Operation, TensorSpec, UnaryOp,
};
use tracejit::passes::FusionPolicy;

/// Dense row-major `f64` tensor. Empty `dims` is a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    dims: Vec<usize>,
    data: Arc<[f64]>,
}

impl CpuTensor {
    pub fn new(dims: impl Into<Vec<usize>>, data: Vec<f64>) -> BackendResult<Self> {
        let dims = dims.into();
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(BackendError::execution(format!(
                "tensor of shape {dims:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            dims,
            data: Arc::from(data),
        })
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            dims: Vec::new(),
            data: Arc::from(vec![value]),
        }
    }

    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            dims: vec![data.len()],
            data: Arc::from(data),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn as_scalar(&self) -> Option<f64> {
        if self.is_scalar() {
            self.data.first().copied()
        } else {
            None
        }
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(DType::F64, self.dims.clone())
    }

    fn from_parts(dims: Vec<usize>, data: Vec<f64>) -> Self {
        Self {
            dims,
            data: Arc::from(data),
        }
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self::from_parts(self.dims.clone(), self.data.iter().map(|&x| f(x)).collect())
    }
}

impl From<f64> for CpuTensor {
    fn from(value: f64) -> Self {
        CpuTensor::scalar(value)
    }
}

/// Reference backend over [`CpuTensor`].
///
/// Every node it runs is counted, [`Operation::Print`] values are kept for inspection, and
/// random draws come from a seeded generator.
pub struct CpuBackend {
    rng: Mutex<StdRng>,
    printed: Mutex<Vec<CpuTensor>>,
    executed: AtomicUsize,
    fusion: bool,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            printed: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
            fusion: true,
        }
    }

    /// Disables elementwise fusion by offering no policy to the executor.
    pub fn without_fusion(mut self) -> Self {
        self.fusion = false;
        self
    }

    /// Number of `execute_node` calls so far, including steps of fused nodes.
    pub fn executed_nodes(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Values passed through print nodes, in execution order.
    pub fn printed(&self) -> Vec<CpuTensor> {
        self.printed.lock().expect("print log poisoned").clone()
    }

    fn uniform(&self, shape: &[usize]) -> CpuTensor {
        let count: usize = shape.iter().product();
        let mut rng = self.rng.lock().expect("cpu rng poisoned");
        let data = (0..count).map(|_| rng.gen::<f64>()).collect();
        CpuTensor::from_parts(shape.to_vec(), data)
    }

    fn print(&self, value: &CpuTensor) -> CpuTensor {
        log::info!("print {:?} {:?}", value.dims, value.data);
        self.printed
            .lock()
            .expect("print log poisoned")
            .push(value.clone());
        value.clone()
    }

    fn execute_export(&self, op: &ExportOp, inputs: &[CpuTensor]) -> BackendResult<Vec<CpuTensor>> {
        let unary = |op: UnaryOp| -> BackendResult<Vec<CpuTensor>> {
            Ok(vec![expect_single(inputs)?.map(|x| op.apply(x))])
        };
        let binary = |op: BinaryOp| -> BackendResult<Vec<CpuTensor>> {
            Ok(vec![op_binary(inputs, op)?])
        };
        match op {
            ExportOp::Add => binary(BinaryOp::Add),
            ExportOp::Sub => binary(BinaryOp::Sub),
            ExportOp::Mul => binary(BinaryOp::Mul),
            ExportOp::Div => binary(BinaryOp::Div),
            ExportOp::Pow => binary(BinaryOp::Pow),
            ExportOp::Max => binary(BinaryOp::Max),
            ExportOp::Min => binary(BinaryOp::Min),
            ExportOp::Neg => unary(UnaryOp::Neg),
            ExportOp::Abs => unary(UnaryOp::Abs),
            ExportOp::Exp => unary(UnaryOp::Exp),
            ExportOp::Log => unary(UnaryOp::Log),
            ExportOp::Sqrt => unary(UnaryOp::Sqrt),
            ExportOp::Tanh => unary(UnaryOp::Tanh),
            ExportOp::Sigmoid => unary(UnaryOp::Sigmoid),
            ExportOp::Relu => unary(UnaryOp::Relu),
            ExportOp::Reciprocal => unary(UnaryOp::Reciprocal),
            ExportOp::Sin => unary(UnaryOp::Sin),
            ExportOp::Cos => unary(UnaryOp::Cos),
            ExportOp::MatMul => Ok(vec![op_matmul(inputs)?]),
            ExportOp::Transpose => Ok(vec![op_transpose(expect_single(inputs)?)]),
            ExportOp::ReduceSum { axis } => Ok(vec![op_reduce_sum(expect_single(inputs)?, *axis)?]),
            ExportOp::Constant(literal) => Ok(vec![literal_to_tensor(literal)?]),
            ExportOp::Identity => Ok(vec![expect_single(inputs)?.clone()]),
            ExportOp::RandomUniform { shape } => Ok(vec![self.uniform(shape)]),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type Value = CpuTensor;

    fn backend_name(&self) -> &str {
        "ref-cpu"
    }

    fn execute_node(&self, node: &Node, inputs: &[CpuTensor]) -> BackendResult<Vec<CpuTensor>> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        let result = match &node.op {
            Operation::Constant(literal) => vec![literal_to_tensor(literal)?],
            Operation::Unary(op) => vec![expect_single(inputs)?.map(|x| op.apply(x))],
            Operation::Binary(op) => vec![op_binary(inputs, *op)?],
            Operation::SinCos => {
                let input = expect_single(inputs)?;
                vec![input.map(f64::sin), input.map(f64::cos)]
            }
            Operation::MatMul => vec![op_matmul(inputs)?],
            Operation::Transpose => vec![op_transpose(expect_single(inputs)?)],
            Operation::ReduceSum { axis } => vec![op_reduce_sum(expect_single(inputs)?, *axis)?],
            Operation::Print => vec![self.print(expect_single(inputs)?)],
            Operation::RngUniform { shape } => vec![self.uniform(shape)],
            Operation::Fused(spec) => execute_fused(self, spec, inputs)?,
            Operation::Export(op) => self.execute_export(op, inputs)?,
        };
        Ok(result)
    }

    fn type_of(&self, value: &CpuTensor) -> Option<TensorSpec> {
        Some(value.spec())
    }

    fn fusion_policy(&self) -> Option<Arc<dyn FusionPolicy>> {
        if self.fusion {
            Some(Arc::new(ElementwiseFusion))
        } else {
            None
        }
    }
}

/// Fuses pure unary and binary nodes whose output shapes agree.
///
/// Unknown shapes are accepted; a scalar producer may feed any consumer since binary
/// kernels broadcast scalars.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElementwiseFusion;

impl FusionPolicy for ElementwiseFusion {
    fn is_fusible(&self, _graph: &Graph, node: &Node) -> bool {
        matches!(node.op, Operation::Unary(_) | Operation::Binary(_))
    }

    fn can_fuse(&self, graph: &Graph, producer: &Node, consumer: &Node) -> bool {
        let ty = |node: &Node| node.outputs.first().and_then(|value| graph.value_type(*value));
        match (ty(producer), ty(consumer)) {
            (Some(produced), Some(consumed)) => {
                produced.dtype == consumed.dtype
                    && (produced.dims == consumed.dims || produced.dims.is_empty())
            }
            _ => true,
        }
    }

    fn name(&self) -> &'static str {
        "elementwise"
    }
}

fn literal_to_tensor(literal: &Literal) -> BackendResult<CpuTensor> {
    match literal {
        Literal::Scalar(value) => Ok(CpuTensor::scalar(*value)),
        Literal::Dense { dims, data } => CpuTensor::new(dims.clone(), data.clone()),
    }
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match inputs {
        [input] => Ok(input),
        _ => Err(BackendError::execution(format!(
            "operation expects a single input, got {}",
            inputs.len()
        ))),
    }
}

fn expect_pair(inputs: &[CpuTensor]) -> BackendResult<(&CpuTensor, &CpuTensor)> {
    match inputs {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(BackendError::execution(format!(
            "operation expects two inputs, got {}",
            inputs.len()
        ))),
    }
}

fn op_binary(inputs: &[CpuTensor], op: BinaryOp) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    if lhs.dims == rhs.dims {
        let data = lhs
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(&a, &b)| op.apply(a, b))
            .collect();
        return Ok(CpuTensor::from_parts(lhs.dims.clone(), data));
    }
    match (lhs.as_scalar(), rhs.as_scalar()) {
        (Some(a), _) => Ok(rhs.map(|b| op.apply(a, b))),
        (_, Some(b)) => Ok(lhs.map(|a| op.apply(a, b))),
        _ => Err(BackendError::execution(format!(
            "`{}` shape mismatch: {:?} vs {:?}",
            op.name(),
            lhs.dims,
            rhs.dims
        ))),
    }
}

fn op_matmul(inputs: &[CpuTensor]) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    let (m, k, n) = match (lhs.dims.as_slice(), rhs.dims.as_slice()) {
        ([m, k], [k2, n]) if k == k2 => (*m, *k, *n),
        _ => {
            return Err(BackendError::execution(format!(
                "matmul needs [m, k] x [k, n], got {:?} x {:?}",
                lhs.dims, rhs.dims
            )))
        }
    };
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let a = lhs.data[i * k + p];
            for j in 0..n {
                out[i * n + j] += a * rhs.data[p * n + j];
            }
        }
    }
    Ok(CpuTensor::from_parts(vec![m, n], out))
}

/// Reverses the axis order.
fn op_transpose(input: &CpuTensor) -> CpuTensor {
    if input.dims.len() < 2 {
        return input.clone();
    }
    let in_strides = compute_strides(&input.dims);
    let out_dims: Vec<usize> = input.dims.iter().rev().copied().collect();
    let rank = out_dims.len();
    let mut out = vec![0.0; input.data.len()];
    for (idx, slot) in out.iter_mut().enumerate() {
        let coord = unravel_index(idx, &out_dims);
        let offset: usize = coord
            .iter()
            .enumerate()
            .map(|(axis, c)| c * in_strides[rank - 1 - axis])
            .sum();
        *slot = input.data[offset];
    }
    CpuTensor::from_parts(out_dims, out)
}

fn op_reduce_sum(input: &CpuTensor, axis: Option<usize>) -> BackendResult<CpuTensor> {
    let Some(axis) = axis else {
        return Ok(CpuTensor::scalar(input.data.iter().sum()));
    };
    if axis >= input.dims.len() {
        return Err(BackendError::execution(format!(
            "reduce_sum axis {axis} out of range for rank {}",
            input.dims.len()
        )));
    }
    let outer: usize = input.dims[..axis].iter().product();
    let extent = input.dims[axis];
    let inner: usize = input.dims[axis + 1..].iter().product();
    let mut out = vec![0.0; outer * inner];
    for o in 0..outer {
        for r in 0..extent {
            for i in 0..inner {
                out[o * inner + i] += input.data[(o * extent + r) * inner + i];
            }
        }
    }
    let mut dims = input.dims.clone();
    dims.remove(axis);
    Ok(CpuTensor::from_parts(dims, out))
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracejit::ir::ValueId;

    fn node(op: Operation, inputs: usize, outputs: usize) -> Node {
        Node::detached(
            op,
            (0..inputs as u32).map(ValueId).collect(),
            (0..outputs as u32).map(|i| ValueId(100 + i)).collect(),
        )
    }

    fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> CpuTensor {
        CpuTensor::new(vec![rows, cols], data).unwrap()
    }

    #[test]
    fn binary_broadcasts_scalars_on_either_side() {
        let backend = CpuBackend::new();
        let v = CpuTensor::vector(vec![1.0, 2.0]);
        let out = backend
            .execute_node(
                &node(Operation::Binary(BinaryOp::Sub), 2, 1),
                &[CpuTensor::scalar(10.0), v.clone()],
            )
            .unwrap();
        assert_eq!(out[0].data(), &[9.0, 8.0]);
        let out = backend
            .execute_node(
                &node(Operation::Binary(BinaryOp::Div), 2, 1),
                &[v, CpuTensor::scalar(2.0)],
            )
            .unwrap();
        assert_eq!(out[0].data(), &[0.5, 1.0]);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let backend = CpuBackend::new();
        let err = backend
            .execute_node(
                &node(Operation::Binary(BinaryOp::Add), 2, 1),
                &[CpuTensor::vector(vec![1.0, 2.0]), CpuTensor::vector(vec![1.0])],
            )
            .unwrap_err();
        assert!(matches!(err, BackendError::Execution { .. }));
    }

    #[test]
    fn matmul_and_transpose() {
        let backend = CpuBackend::new();
        let a = matrix(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = backend
            .execute_node(&node(Operation::Transpose, 1, 1), &[a.clone()])
            .unwrap();
        assert_eq!(t[0].dims(), &[3, 2]);
        assert_eq!(t[0].data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let p = backend
            .execute_node(&node(Operation::MatMul, 2, 1), &[a, t[0].clone()])
            .unwrap();
        assert_eq!(p[0].data(), &[14.0, 32.0, 32.0, 77.0]);
    }

    #[test]
    fn reduce_sum_along_axis_and_whole() {
        let a = matrix(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(op_reduce_sum(&a, Some(0)).unwrap().data(), &[5.0, 7.0, 9.0]);
        assert_eq!(op_reduce_sum(&a, Some(1)).unwrap().data(), &[6.0, 15.0]);
        assert_eq!(op_reduce_sum(&a, None).unwrap().as_scalar(), Some(21.0));
        assert!(op_reduce_sum(&a, Some(2)).is_err());
    }

    #[test]
    fn print_passes_through_and_records() {
        let backend = CpuBackend::new();
        let out = backend
            .execute_node(&node(Operation::Print, 1, 1), &[CpuTensor::scalar(4.0)])
            .unwrap();
        assert_eq!(out[0].as_scalar(), Some(4.0));
        assert_eq!(backend.printed(), vec![CpuTensor::scalar(4.0)]);
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let draw = |seed| {
            CpuBackend::with_seed(seed)
                .execute_node(&node(Operation::RngUniform { shape: vec![4] }, 0, 1), &[])
                .unwrap()
        };
        assert_eq!(draw(7), draw(7));
        assert!(draw(7)[0].data().iter().all(|x| (0.0..1.0).contains(x)));
    }

    #[test]
    fn export_ops_match_internal_ops() {
        let backend = CpuBackend::new();
        let x = CpuTensor::vector(vec![0.25, 4.0]);
        let internal = backend
            .execute_node(&node(Operation::Unary(UnaryOp::Sqrt), 1, 1), &[x.clone()])
            .unwrap();
        let exported = backend
            .execute_node(&node(Operation::Export(ExportOp::Sqrt), 1, 1), &[x])
            .unwrap();
        assert_eq!(internal, exported);
        assert_eq!(backend.executed_nodes(), 2);
    }

    #[test]
    fn fusion_policy_rejects_shape_changes() {
        let mut graph = Graph::new("g");
        let x = graph.add_input(Some(TensorSpec::new(DType::F64, vec![2]))).unwrap();
        let s = graph
            .push_node(
                Operation::ReduceSum { axis: None },
                vec![x],
                Default::default(),
                vec![Some(TensorSpec::scalar(DType::F64))],
            )
            .unwrap();
        let e = graph
            .push_node(
                Operation::Unary(UnaryOp::Exp),
                vec![x],
                Default::default(),
                vec![Some(TensorSpec::new(DType::F64, vec![2]))],
            )
            .unwrap();
        let (s, e) = (graph.node(s).unwrap(), graph.node(e).unwrap());
        assert!(!ElementwiseFusion.is_fusible(&graph, s));
        assert!(ElementwiseFusion.is_fusible(&graph, e));
        assert!(!ElementwiseFusion.can_fuse(&graph, e, s));
        assert!(ElementwiseFusion.can_fuse(&graph, s, e));
    }
}

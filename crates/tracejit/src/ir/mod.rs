//! SSA dataflow IR: values, nodes, graphs, and the editing tools passes build on.

pub mod graph;
pub mod index;
pub mod registry;
pub mod rewriter;
pub mod spec;
mod text;

pub use graph::{Graph, Node, ValueDef, ValueRecord};
pub use index::GraphIndex;
pub use registry::{registry, OpKind, OpSignature, Purity};
pub use rewriter::GraphRewriter;
pub use spec::{
    Attr, BinaryOp, DType, ExportOp, FusedArg, FusedOp, FusedSpec, FusedStep, Literal, NodeId,
    Operation, TensorSpec, UnaryOp, ValueId,
};

use thiserror::Error;

use crate::ir::{NodeId, ValueId};

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A traced callback returned something that is not a value recorded by its own session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceIdentityError {
    #[error("traced callback returned no outputs")]
    NoOutputs,
    #[error("output {index} is a concrete value that no traced operator produced")]
    Untraced { index: usize },
    #[error("output {index} belongs to a different tracing session")]
    ForeignSession { index: usize },
    #[error("output {index} refers to {value}, which is not defined in this trace")]
    UnknownValue { index: usize, value: ValueId },
}

/// Structural damage found by lint or by building a graph index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphInvariantError {
    #[error("graph has no outputs")]
    NoOutputs,
    #[error("graph output {value} is not defined")]
    UndefinedOutput { value: ValueId },
    #[error("node {node} uses {value}, which is not defined")]
    DanglingValue { node: NodeId, value: ValueId },
    #[error("node {node} uses {value} before its definition")]
    UseBeforeDef { node: NodeId, value: ValueId },
    #[error("{value} is defined more than once")]
    DuplicateDefinition { value: ValueId },
    #[error("node {node} appears more than once in the topological order")]
    NodeListedTwice { node: NodeId },
    #[error("topological order references missing node {node}")]
    MissingNode { node: NodeId },
    #[error("node {node} is allocated but absent from the topological order")]
    UnorderedNode { node: NodeId },
    #[error("value record for {value} disagrees with its producer")]
    DefinitionMismatch { value: ValueId },
    #[error("graph input {index} ({value}) is not recorded as an input definition")]
    InputMismatch { index: usize, value: ValueId },
    #[error("node {node} ({op}) expects {expected} {role}, found {actual}")]
    ArityMismatch {
        node: NodeId,
        op: String,
        role: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("fused node {node} is malformed: {reason}")]
    MalformedFused { node: NodeId, reason: String },
    #[error("node {node} still has users of its outputs")]
    NodeHasUsers { node: NodeId },
    #[error("graph is frozen; no further nodes may be appended")]
    Frozen,
}

/// The lowering pass met an internal operator with no rule into the exchange set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no lowering rule for operator `{op}` (node {node})")]
pub struct LoweringError {
    pub op: String,
    pub node: NodeId,
}

/// `unflatten` received a value sequence that does not fit the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("descriptor expects {expected} leaves, received {actual}")]
pub struct ShapeMismatchError {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected} {role}, received {actual}")]
pub struct CallArityError {
    pub role: &'static str,
    pub expected: usize,
    pub actual: usize,
}

/// Failure reported by a numeric backend while executing a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend does not implement `{op}`: {reason}")]
    Unimplemented { op: String, reason: String },
    #[error("backend execution failed: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op: op.into(),
            reason: reason.into(),
        }
    }
}

/// Misuse of a tracing session while recording.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("tracing session has already exited")]
    Exited,
    #[error("tracing session has not exited yet")]
    NotExited,
    #[error("{value} belongs to a different tracing session")]
    ForeignValue { value: ValueId },
    #[error("{value} is not defined in this tracing session")]
    UnknownValue { value: ValueId },
    #[error("operator `{op}` takes {expected} inputs, received {actual}")]
    Arity {
        op: String,
        expected: usize,
        actual: usize,
    },
    #[error("{num_ordinary} ordinary inputs requested but only {total} inputs were supplied")]
    TooManyOrdinary { num_ordinary: usize, total: usize },
    #[error("capture index {index} out of range ({count} captures)")]
    CaptureIndex { index: usize, count: usize },
    #[error(transparent)]
    Graph(#[from] GraphInvariantError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassError {
    #[error(transparent)]
    Invariant(#[from] GraphInvariantError),
    #[error(transparent)]
    Lowering(#[from] LoweringError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pass `{pass}` failed: {source}")]
    Pass {
        pass: &'static str,
        #[source]
        source: PassError,
    },
    #[error("lint failed after `{after}`: {source}")]
    Lint {
        after: &'static str,
        #[source]
        source: GraphInvariantError,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    TraceIdentity(#[from] TraceIdentityError),
    #[error(transparent)]
    GraphInvariant(#[from] GraphInvariantError),
    #[error(transparent)]
    Lowering(#[from] LoweringError),
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),
    #[error(transparent)]
    CallArity(#[from] CallArityError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("capture {index} has no bound value")]
    CaptureUnbound { index: usize },
    #[error(transparent)]
    Callback(#[from] anyhow::Error),
}

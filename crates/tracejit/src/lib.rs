//! Trace a numeric callback into an SSA graph, optimize the graph once, and replay it.
//!
//! The crate is split along the lifetime of a traced computation:
//!
//! ```text
//! host callback
//!      |
//!      | trace::enter / Traced ops / TracingState::exit
//!      v
//! ir::Graph  --(passes + pipeline, at most once)-->  optimized ir::Graph
//!      |                                                   |
//!      | executor::interpret (fallback)                    | executor::ExecutionPlan
//!      v                                                   v
//!                 executor::GraphExecutor::run
//! ```
//!
//! Numeric kernels are not part of this crate. Every operator is executed through the
//! [`executor::Backend`] trait, which external crates implement.

pub mod codec;
mod env;
pub mod error;
pub mod executor;
pub mod hashing;
pub mod ir;
pub mod passes;
pub mod pipeline;
pub mod trace;

pub use codec::{flatten, unflatten, IoDescriptor, Nested, StaticValue};
pub use error::{
    BackendError, BackendResult, CallArityError, Error, GraphInvariantError, LoweringError,
    Result, ShapeMismatchError, TraceError, TraceIdentityError,
};
pub use executor::{
    Backend, ExecutorConfig, ExecutorState, GraphExecutor, OptimizePolicy, Returned,
};
pub use ir::{Graph, Node, NodeId, Operation, ValueId};
pub use trace::{TraceInput, TraceOutput, Traced, TracingState};

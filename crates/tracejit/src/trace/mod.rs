//! Recording host computations into a [`Graph`](crate::ir::Graph).
//!
//! A session is opened with [`enter`], which seeds one graph input per supplied value and
//! returns proxies for them. Operations on [`Traced`] proxies append nodes. Closing the
//! session with [`TracingState::exit`] marks the outputs and freezes the graph.

mod state;
mod traced;

pub use crate::error::{TraceError, TraceIdentityError};
pub use state::{enter, TraceInput, TraceOutput, TracingState};
pub use traced::Traced;

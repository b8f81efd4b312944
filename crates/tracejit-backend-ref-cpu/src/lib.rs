//! Reference `f64` CPU backend for tracejit graphs.
//!
//! Executes both the internal and the exchange operator sets, and supplies an elementwise
//! fusion policy. Intended for tests and as a template for real backends.

pub mod cpu;

pub use cpu::{CpuBackend, CpuTensor, ElementwiseFusion};

//! Dense-flow estimation seam.
//!
//! The pipeline consumes flow estimation as an external numeric capability:
//! `FlowEngine` owns the call contract (parameter set, window-size parity
//! correction, output shape) while the estimation algorithm itself lives
//! behind the `FlowBackend` trait. The crate ships a coarse block-matching
//! CPU backend and a uniform stub backend for tests.

mod backends;
mod engine;

pub use backends::{backend_for, BlockMatchFlow, UniformFlow};
pub use engine::{effective_window_size, FlowBackend, FlowEngine, FlowParams};

//! Mempool adapter and in-memory pool.
//!
//! Consensus only sees the [`Mempool`] trait: it pulls transaction ids for
//! the next batch and reports ids once they are committed. The pool itself
//! is a pure, synchronous state machine like the rest of the engine.

mod adapter;
mod state;

pub use adapter::{AdmissionError, Mempool};
pub use state::{MempoolConfig, MempoolState};

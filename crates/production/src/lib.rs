//! Production runner with async I/O.
//!
//! This crate wraps the deterministic node state machine with real time and
//! real channels:
//!
//! - Network messages arrive through a [`network::Transport`]
//! - Timers are tokio tasks
//! - Committed entries and engine events are reported as [`NodeOutput`]s
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events via prioritized mpsc channels. This avoids mutex
//! contention and keeps the state machine free of locks.
//!
//! ```text
//!             timers ─┐
//!   internal callbacks ─┤
//!   consensus messages ─┼─► ProductionRunner ─► NodeStateMachine::handle
//!   client submissions ─┘          │
//!                                  ├─► Transport::broadcast
//!                                  └─► NodeOutput channel + metrics
//! ```

pub mod config;
pub mod metrics;
pub mod network;
mod runner;
pub mod telemetry;
mod timers;

pub use config::{ConfigError, DevnetConfig};
pub use runner::{
    NodeOutput, ProductionRunner, ProductionRunnerBuilder, RunnerError, ShutdownHandle,
    TransactionSubmitter,
};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError, TelemetryGuard};
pub use timers::TimerManager;

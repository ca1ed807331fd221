//! Core types for Blockmania consensus.
//!
//! This crate provides the foundational types for the engine architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait that all state machines implement
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (simulation or production) which
//! delivers events, executes the returned actions, and feeds results back
//! in as new events.

mod action;
mod event;
mod message;
mod traits;

pub use action::{Action, AdmissionOutcome, ConsensusEvent, RejectReason};
pub use event::{Event, EventPriority};
pub use message::OutboundMessage;
pub use traits::{StateMachine, SubStateMachine};

/// Timer identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Batch proposal timer
    Proposal,
    /// Recurring stall check driving the view-change machine
    ViewChange,
    /// Periodic cleanup timer
    Cleanup,
}

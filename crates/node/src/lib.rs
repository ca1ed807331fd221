//! Composed node state machine.
//!
//! [`NodeStateMachine`] ties consensus and the mempool together behind the
//! [`StateMachine`](blockmania_core::StateMachine) trait, so a runner only
//! ever deals with one component per node.

mod state;

pub use state::{NodeIndex, NodeStateMachine};

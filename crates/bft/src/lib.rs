//! Blockmania consensus state machine.
//!
//! This crate provides a synchronous implementation of the Blockmania
//! Byzantine atomic broadcast engine that can be used for both simulation
//! and production.
//!
//! # Architecture
//!
//! The state machine processes events synchronously:
//!
//! - `Event::ProposalTimer` → Propose the next batch if the local round may advance
//! - `Event::ProposalReceived` → Validate, add to the causal graph, prepare
//! - `Event::StatementReceived` → Record prepares, commits and view changes
//! - `Event::ViewChangeTimer` → Detect stalls, request and escalate view changes
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Terminology
//!
//! - **Coordinate**: A `(node, round)` pair. Every member proposes at most
//!   one batch per round, so a coordinate names one slot of the graph.
//!
//! - **Strong / weak quorum**: `(n + f) / 2 + 1` and `f + 1` distinct signers
//!   of the same hash. Strong is `2f + 1` when `n = 3f + 1`.
//!
//! - **Anchor**: The batch of the designated member at an odd round. Anchors
//!   are the points at which the graph is linearized.
//!
//! - **View**: Liveness epoch. Advancing it releases a stalled anchor; it
//!   never changes which batch is an anchor.
//!
//! # Protocol
//!
//! ## Safety
//!
//! - **Vote lock**: A node prepares only the first valid proposal it sees
//!   for a coordinate, so two hashes cannot both reach strong quorum there.
//!
//! - **Strong parents**: A batch references a strong quorum of strong
//!   batches of the previous round, so any anchor decided by one node is in
//!   the history of every later anchor.
//!
//! - **Deterministic linearization**: The committed prefix depends only on
//!   the graph, never on arrival order.
//!
//! ## Liveness
//!
//! - **Anchor wait**: Before voting on an anchor a node waits for it, up to
//!   the round timeout.
//!
//! - **View change**: A weak quorum of stalled nodes moves the committee to
//!   the next view and past the missing anchor.

mod config;
mod graph;
mod ordering;
mod round_log;
mod state;
mod view_change;

pub use config::BftConfig;
pub use graph::{CausalGraph, GraphError, HistoryGap, InsertOutcome};
pub use ordering::{decision_threshold, CommittedPrefix, OrderingEngine};
pub use round_log::{QuorumStatus, RecordOutcome, RoundLog, RoundSlot};
pub use state::{BftStats, BlockmaniaState};
pub use view_change::{ViewChangeOutput, ViewChangeState, ViewPhase};

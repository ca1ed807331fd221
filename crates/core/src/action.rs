//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, Event, TimerId};
use blockmania_types::{CommittedEntry, Coordinate, Hash, MessageKind, NodeId, TxId, View};
use std::fmt;
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every other committee member.
    ///
    /// The local node has already recorded its own copy.
    Broadcast { message: OutboundMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration, replacing any pending one.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Outputs to the embedding application
    // ═══════════════════════════════════════════════════════════════════════
    /// New entries appended to the committed prefix, in order.
    EmitCommitted { entries: Vec<CommittedEntry> },

    /// Observability event.
    EmitConsensusEvent { event: ConsensusEvent },

    /// Result of a client submission.
    EmitAdmissionOutcome { tx_id: TxId, outcome: AdmissionOutcome },
}

impl Action {
    /// Check if this is an internal event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }

    /// Check if this action produces network I/O.
    pub fn is_network(&self) -> bool {
        matches!(self, Action::Broadcast { .. })
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::EmitCommitted { .. } => "EmitCommitted",
            Action::EmitConsensusEvent { .. } => "EmitConsensusEvent",
            Action::EmitAdmissionOutcome { .. } => "EmitAdmissionOutcome",
        }
    }
}

/// Outcome of submitting a transaction to the mempool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionOutcome {
    /// Newly admitted.
    Succeed,
    /// Already pending or in flight.
    AlreadyExists,
    /// Refused by admission rules.
    Rejected,
}

impl AdmissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionOutcome::Succeed => "succeed",
            AdmissionOutcome::AlreadyExists => "already_exists",
            AdmissionOutcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for AdmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an inbound message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Signature did not verify for the claimed sender.
    BadSignature,
    /// Sender is not a committee member.
    UnknownSender,
    /// Fields are inconsistent with the message kind or its payload.
    Malformed,
    /// A batch references a parent at the same or a later round.
    CausalViolation,
    /// The message is about rounds that were already garbage collected.
    Stale,
    /// The message is about a round too far above the local frontier.
    TooFarAhead,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::BadSignature => "bad_signature",
            RejectReason::UnknownSender => "unknown_sender",
            RejectReason::Malformed => "malformed",
            RejectReason::CausalViolation => "causal_violation",
            RejectReason::Stale => "stale",
            RejectReason::TooFarAhead => "too_far_ahead",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability events surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A sender signed two different hashes under one uniqueness key.
    EquivocationDetected {
        sender: NodeId,
        coordinate: Coordinate,
        kind: MessageKind,
        first: Hash,
        second: Hash,
    },

    /// Local stall detected; a view-change request was broadcast.
    ViewChangeStarted { view: View, target: View },

    /// A new view became active.
    ViewChanged { from: View, to: View },

    /// A coordinate was appended to the committed prefix.
    Committed {
        position: u64,
        coordinate: Coordinate,
        hash: Hash,
    },

    /// Repeated escalations without progress.
    LivenessDegraded { view: View, escalations: u32 },

    /// An inbound message was dropped.
    MessageRejected { sender: NodeId, reason: RejectReason },
}

impl ConsensusEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusEvent::EquivocationDetected { .. } => "EquivocationDetected",
            ConsensusEvent::ViewChangeStarted { .. } => "ViewChangeStarted",
            ConsensusEvent::ViewChanged { .. } => "ViewChanged",
            ConsensusEvent::Committed { .. } => "Committed",
            ConsensusEvent::LivenessDegraded { .. } => "LivenessDegraded",
            ConsensusEvent::MessageRejected { .. } => "MessageRejected",
        }
    }
}

//! Event types for the deterministic state machine.

use blockmania_messages::{ProposalGossip, StatementGossip};
use blockmania_types::CommittedEntry;
use std::sync::Arc;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,

    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Time to propose the next batch, if the local round may advance.
    ProposalTimer,

    /// Periodic stall check for the view-change machine.
    ViewChangeTimer,

    /// Periodic cleanup of stale state.
    CleanupTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// Received a pre-prepare and its batch.
    ///
    /// Sender identity comes from the signed message, not the transport.
    ProposalReceived { gossip: ProposalGossip },

    /// Received a prepare, commit or view-change.
    StatementReceived { gossip: StatementGossip },

    // ═══════════════════════════════════════════════════════════════════════
    // Client Requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client submitted a transaction payload to this node.
    SubmitTransaction { payload: Arc<Vec<u8>> },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// Entries were appended to the committed prefix.
    ///
    /// Routed to the mempool so it can evict committed transactions.
    BatchesCommitted { entries: Vec<CommittedEntry> },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::BatchesCommitted { .. } => EventPriority::Internal,

            Event::ProposalTimer | Event::ViewChangeTimer | Event::CleanupTimer => {
                EventPriority::Timer
            }

            Event::ProposalReceived { .. } | Event::StatementReceived { .. } => {
                EventPriority::Network
            }

            Event::SubmitTransaction { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event.
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Check if this is a timer event.
    pub fn is_timer(&self) -> bool {
        self.priority() == EventPriority::Timer
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ProposalTimer => "ProposalTimer",
            Event::ViewChangeTimer => "ViewChangeTimer",
            Event::CleanupTimer => "CleanupTimer",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::StatementReceived { .. } => "StatementReceived",
            Event::SubmitTransaction { .. } => "SubmitTransaction",
            Event::BatchesCommitted { .. } => "BatchesCommitted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(EventPriority::Internal < EventPriority::Timer);
        assert!(EventPriority::Timer < EventPriority::Network);
        assert!(EventPriority::Network < EventPriority::Client);
    }

    #[test]
    fn test_event_classification() {
        assert!(Event::BatchesCommitted { entries: vec![] }.is_internal());
        assert!(Event::ViewChangeTimer.is_timer());
        assert_eq!(
            Event::SubmitTransaction {
                payload: Arc::new(vec![1])
            }
            .priority(),
            EventPriority::Client
        );
    }
}

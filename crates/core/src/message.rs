//! Outbound message types for network communication.

use blockmania_messages::{NetworkMessage, ProposalGossip, StatementGossip};

/// Outbound network messages.
///
/// Every message is broadcast to the whole committee. The runner handles the
/// actual network I/O and never echoes a message back to its sender.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Pre-prepare carrying its batch.
    Proposal(ProposalGossip),

    /// Prepare, commit or view-change.
    Statement(StatementGossip),
}

impl OutboundMessage {
    /// Get a stable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Proposal(_) => ProposalGossip::message_type_id(),
            OutboundMessage::Statement(_) => StatementGossip::message_type_id(),
        }
    }

    /// Short human-readable summary for logs.
    pub fn summary(&self) -> String {
        match self {
            OutboundMessage::Proposal(gossip) => gossip.message.to_string(),
            OutboundMessage::Statement(gossip) => gossip.message.to_string(),
        }
    }
}

//! Network messages for the Blockmania protocol.
//!
//! Every message is a broadcast to the whole committee. Sender identity
//! comes from the signed [`blockmania_types::Message`], never from the
//! transport.

pub mod gossip;

pub use gossip::{ProposalGossip, StatementGossip};

/// Marker for types sent over the wire.
pub trait NetworkMessage {
    /// Stable identifier used for topic names and metric labels.
    fn message_type_id() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmania_types::{Batch, Hash, Message, NodeId, Round, Signature, View};
    use std::sync::Arc;

    #[test]
    fn test_proposal_batch_ref_uses_message_claims() {
        let batch = Arc::new(Batch::new(NodeId(1), Round(1), vec![], vec![]));
        let claimed = Hash::from_bytes(b"claimed");
        let gossip = ProposalGossip::new(
            Message::pre_prepare(claimed, NodeId(1), Round(1), View(0)),
            batch,
            Signature::empty(),
        );
        assert_eq!(gossip.batch_ref().hash, claimed);
        assert_eq!(gossip.batch_ref().coordinate, gossip.batch.coordinate());
    }

    #[test]
    fn test_type_ids_are_distinct() {
        assert_ne!(
            ProposalGossip::message_type_id(),
            StatementGossip::message_type_id()
        );
    }
}

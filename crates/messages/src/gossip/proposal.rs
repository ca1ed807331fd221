//! Proposal gossip: a pre-prepare together with the batch it announces.

use crate::NetworkMessage;
use blockmania_types::{Batch, BatchRef, Message, Signature};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A signed pre-prepare and the batch its hash commits to.
///
/// The batch travels with its announcement so a receiver can build the
/// causal edges as soon as the pre-prepare is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalGossip {
    pub message: Message,
    pub batch: Arc<Batch>,
    pub signature: Signature,
}

impl ProposalGossip {
    pub fn new(message: Message, batch: Arc<Batch>, signature: Signature) -> Self {
        Self {
            message,
            batch,
            signature,
        }
    }

    /// Reference to the announced batch, as claimed by the message.
    pub fn batch_ref(&self) -> BatchRef {
        BatchRef::new(self.message.node_round(), self.message.hash())
    }

    pub fn into_parts(self) -> (Message, Arc<Batch>, Signature) {
        (self.message, self.batch, self.signature)
    }
}

impl NetworkMessage for ProposalGossip {
    fn message_type_id() -> &'static str {
        "consensus.proposal"
    }
}

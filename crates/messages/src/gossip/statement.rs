//! Statement gossip: prepare, commit and view-change messages.

use crate::NetworkMessage;
use blockmania_types::{Message, Signature};
use serde::{Deserialize, Serialize};

/// A signed consensus message that carries no payload of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementGossip {
    pub message: Message,
    pub signature: Signature,
}

impl StatementGossip {
    pub fn new(message: Message, signature: Signature) -> Self {
        Self { message, signature }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_parts(self) -> (Message, Signature) {
        (self.message, self.signature)
    }
}

impl NetworkMessage for StatementGossip {
    fn message_type_id() -> &'static str {
        "consensus.statement"
    }
}

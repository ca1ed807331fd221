//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: JSON-encoded gossip struct]
//! ```
//!
//! - Version is currently `1`
//! - Payload is a serde-encoded gossip struct (`ProposalGossip` or
//!   `StatementGossip`)
//!
//! # Topic-Based Type Dispatch
//!
//! Message type is determined by the topic the frame was published on, not
//! by a field in the payload.

use blockmania_core::{Event, OutboundMessage};
use blockmania_messages::{NetworkMessage, ProposalGossip, StatementGossip};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Topic an outbound message is published on.
pub fn topic_for(message: &OutboundMessage) -> &'static str {
    match message {
        OutboundMessage::Proposal(_) => ProposalGossip::message_type_id(),
        OutboundMessage::Statement(_) => StatementGossip::message_type_id(),
    }
}

/// Encode an outbound message to wire format.
pub fn encode_message(message: &OutboundMessage) -> Result<Vec<u8>, CodecError> {
    let payload = match message {
        OutboundMessage::Proposal(gossip) => serde_json::to_vec(gossip),
        OutboundMessage::Statement(gossip) => serde_json::to_vec(gossip),
    }
    .map_err(CodecError::Encode)?;

    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a frame received on `topic` into the event it delivers.
pub fn decode_message(topic: &str, data: &[u8]) -> Result<Event, CodecError> {
    let (&version, payload) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }

    if topic == ProposalGossip::message_type_id() {
        let gossip: ProposalGossip = serde_json::from_slice(payload).map_err(CodecError::Decode)?;
        Ok(Event::ProposalReceived { gossip })
    } else if topic == StatementGossip::message_type_id() {
        let gossip: StatementGossip =
            serde_json::from_slice(payload).map_err(CodecError::Decode)?;
        Ok(Event::StatementReceived { gossip })
    } else {
        Err(CodecError::UnknownTopic(topic.to_string()))
    }
}

//! Consensus messages.

use crate::{signing, Coordinate, Hash, NodeId, Round, View};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four message kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    ViewChange,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::PrePrepare,
        MessageKind::Prepare,
        MessageKind::Commit,
        MessageKind::ViewChange,
    ];

    /// Lowercase name used in message display and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PrePrepare => "pre-prepare",
            MessageKind::Prepare => "prepare",
            MessageKind::Commit => "commit",
            MessageKind::ViewChange => "view-change",
        }
    }

    /// Single-byte tag mixed into signing payloads.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            MessageKind::PrePrepare => 1,
            MessageKind::Prepare => 2,
            MessageKind::Commit => 3,
            MessageKind::ViewChange => 4,
        }
    }

    /// Kinds that attest to a coordinate's content and count toward quorum.
    pub fn is_attestation(&self) -> bool {
        matches!(self, MessageKind::Prepare | MessageKind::Commit)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields shared by every message kind.
///
/// `node` and `round` name the coordinate the message is about, `sender` is
/// the signer. For view-change messages `node == sender` and `round` is the
/// sender's current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    pub hash: Hash,
    pub node: NodeId,
    pub round: Round,
    pub sender: NodeId,
    pub view: View,
}

/// A signed-over consensus message. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Message {
    PrePrepare(Statement),
    Prepare(Statement),
    Commit(Statement),
    ViewChange(Statement),
}

impl Message {
    pub fn new(kind: MessageKind, statement: Statement) -> Self {
        match kind {
            MessageKind::PrePrepare => Message::PrePrepare(statement),
            MessageKind::Prepare => Message::Prepare(statement),
            MessageKind::Commit => Message::Commit(statement),
            MessageKind::ViewChange => Message::ViewChange(statement),
        }
    }

    pub fn pre_prepare(hash: Hash, node: NodeId, round: Round, view: View) -> Self {
        Message::PrePrepare(Statement {
            hash,
            node,
            round,
            sender: node,
            view,
        })
    }

    pub fn prepare(hash: Hash, coordinate: Coordinate, sender: NodeId, view: View) -> Self {
        Message::Prepare(Statement {
            hash,
            node: coordinate.node,
            round: coordinate.round,
            sender,
            view,
        })
    }

    pub fn commit(hash: Hash, coordinate: Coordinate, sender: NodeId, view: View) -> Self {
        Message::Commit(Statement {
            hash,
            node: coordinate.node,
            round: coordinate.round,
            sender,
            view,
        })
    }

    /// A request to move to `target`, carrying the sender's last safe hash.
    pub fn view_change(last_safe: Hash, sender: NodeId, round: Round, target: View) -> Self {
        Message::ViewChange(Statement {
            hash: last_safe,
            node: sender,
            round,
            sender,
            view: target,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PrePrepare(_) => MessageKind::PrePrepare,
            Message::Prepare(_) => MessageKind::Prepare,
            Message::Commit(_) => MessageKind::Commit,
            Message::ViewChange(_) => MessageKind::ViewChange,
        }
    }

    pub fn statement(&self) -> &Statement {
        match self {
            Message::PrePrepare(s)
            | Message::Prepare(s)
            | Message::Commit(s)
            | Message::ViewChange(s) => s,
        }
    }

    pub fn hash(&self) -> Hash {
        self.statement().hash
    }

    pub fn node(&self) -> NodeId {
        self.statement().node
    }

    pub fn round(&self) -> Round {
        self.statement().round
    }

    pub fn sender(&self) -> NodeId {
        self.statement().sender
    }

    pub fn view(&self) -> View {
        self.statement().view
    }

    /// The coordinate this message is about.
    pub fn node_round(&self) -> Coordinate {
        Coordinate::new(self.node(), self.round())
    }

    /// Canonical bytes covered by the sender's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        signing::message_signing_bytes(self.kind(), self.statement())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.statement();
        write!(
            f,
            "{}{{node: {}, round: {}, view: {}, hash: '{}', sender: {}}}",
            self.kind(),
            s.node,
            s.round,
            s.view,
            s.hash,
            s.sender
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format_is_stable() {
        let msg = Message::prepare(
            Hash::from_hash_bytes({
                let mut b = [0u8; 32];
                b[..4].copy_from_slice(&[0x3f, 0xa1, 0xc2, 0xd0]);
                b
            }),
            Coordinate::new(NodeId(1), Round(4)),
            NodeId(2),
            View(0),
        );
        assert_eq!(
            msg.to_string(),
            "prepare{node: 1, round: 4, view: 0, hash: '3fa1c2d0…', sender: 2}"
        );
    }

    #[test]
    fn test_view_change_fields() {
        let msg = Message::view_change(Hash::NIL, NodeId(3), Round(7), View(2));
        assert_eq!(msg.kind(), MessageKind::ViewChange);
        assert_eq!(msg.node(), msg.sender());
        assert_eq!(msg.node_round(), Coordinate::new(NodeId(3), Round(7)));
        assert!(msg.to_string().starts_with("view-change{"));
    }

    #[test]
    fn test_signing_bytes_differ_by_kind() {
        let coord = Coordinate::new(NodeId(0), Round(1));
        let hash = Hash::from_bytes(b"batch");
        let prepare = Message::prepare(hash, coord, NodeId(1), View(0));
        let commit = Message::commit(hash, coord, NodeId(1), View(0));
        assert_ne!(prepare.signing_bytes(), commit.signing_bytes());
    }
}

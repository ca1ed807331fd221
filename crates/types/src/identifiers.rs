//! Identifier newtypes.

use crate::Hash;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identity of a committee member.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node-local round counter. Round 0 is never proposed; the first batch of
/// every node is at round 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Round(pub u64);

impl Round {
    pub const ZERO: Round = Round(0);
    pub const GENESIS: Round = Round(1);

    /// Next round, saturating at `u64::MAX`.
    pub fn next(self) -> Self {
        Round(self.0.saturating_add(1))
    }

    /// Previous round, saturating at zero.
    pub fn prev(self) -> Self {
        Round(self.0.saturating_sub(1))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A view number, advanced by the view-change protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct View(pub u32);

impl View {
    pub const INITIAL: View = View(0);

    pub fn next(self) -> Self {
        View(self.0.saturating_add(1))
    }

    /// Number of views between `self` and a later view.
    pub fn distance_to(self, later: View) -> u32 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (node, round) position in the causal graph.
///
/// Ordered by round first, then node, which is the order committed entries
/// take within a single ordering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub node: NodeId,
    pub round: Round,
}

impl Coordinate {
    pub fn new(node: NodeId, round: Round) -> Self {
        Self { node, round }
    }
}

impl Ord for Coordinate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.round
            .cmp(&other.round)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for Coordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.node, self.round)
    }
}

/// A content-addressed reference to one batch at one coordinate.
///
/// A Byzantine proposer may publish several batches for the same
/// coordinate, so references carry the batch digest as well. The derived
/// ordering is (round, node, hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchRef {
    pub coordinate: Coordinate,
    pub hash: Hash,
}

impl BatchRef {
    pub fn new(coordinate: Coordinate, hash: Hash) -> Self {
        Self { coordinate, hash }
    }

    pub fn node(&self) -> NodeId {
        self.coordinate.node
    }

    pub fn round(&self) -> Round {
        self.coordinate.round
    }
}

impl fmt::Display for BatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.coordinate, self.hash)
    }
}

/// Identifier of a client transaction: the digest of its payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub Hash);

impl TxId {
    pub fn for_payload(payload: &[u8]) -> Self {
        TxId(Hash::from_bytes(payload))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

//! Committee topology: membership, fault tolerance and leader rotation.

use crate::{NodeId, Round};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Committee view used by consensus.
///
/// The committee is fixed for the lifetime of a node. Members are kept in
/// ascending id order so every node derives the same leader schedule.
pub trait Topology: Send + Sync {
    /// The local node's id.
    fn local_node_id(&self) -> NodeId;

    /// Committee members in ascending id order.
    fn members(&self) -> &[NodeId];

    // Derived methods

    /// Number of members, `n`.
    fn committee_size(&self) -> usize {
        self.members().len()
    }

    /// Maximum tolerated Byzantine members, `f = (n - 1) / 3`.
    fn max_faulty(&self) -> usize {
        self.committee_size().saturating_sub(1) / 3
    }

    /// Strong quorum size.
    ///
    /// Equals `2f + 1` when `n = 3f + 1`. For other committee sizes it is the
    /// smallest count for which any two quorums share `f + 1` members.
    fn strong_quorum(&self) -> usize {
        (self.committee_size() + self.max_faulty()) / 2 + 1
    }

    /// Weak quorum size, `f + 1`: at least one honest member.
    fn weak_quorum(&self) -> usize {
        self.max_faulty() + 1
    }

    fn is_member(&self, node: NodeId) -> bool {
        self.members().binary_search(&node).is_ok()
    }

    fn member_index(&self, node: NodeId) -> Option<usize> {
        self.members().binary_search(&node).ok()
    }

    /// Anchor rounds are the odd rounds. Each even round votes on the
    /// anchor of the round before it.
    fn is_anchor_round(&self, round: Round) -> bool {
        round.0 % 2 == 1
    }

    /// Designated anchor node of a round.
    ///
    /// Rotates through the committee once per anchor round. For even rounds
    /// this returns the leader of the preceding anchor round.
    fn leader_for(&self, round: Round) -> NodeId {
        let members = self.members();
        let wave = round.0.saturating_sub(1) / 2;
        members[(wave % members.len() as u64) as usize]
    }

    fn is_local_leader(&self, round: Round) -> bool {
        self.leader_for(round) == self.local_node_id()
    }
}

/// Errors building a topology.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("committee is empty")]
    EmptyCommittee,

    #[error("node {0} is not in the committee")]
    NotInCommittee(NodeId),

    #[error("node {0} appears more than once in the committee")]
    DuplicateMember(NodeId),
}

/// A fixed committee.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    local_node_id: NodeId,
    members: Vec<NodeId>,
}

impl StaticTopology {
    pub fn new(local_node_id: NodeId, members: Vec<NodeId>) -> Result<Self, TopologyError> {
        if members.is_empty() {
            return Err(TopologyError::EmptyCommittee);
        }
        let mut seen = BTreeSet::new();
        for member in &members {
            if !seen.insert(*member) {
                return Err(TopologyError::DuplicateMember(*member));
            }
        }
        if !seen.contains(&local_node_id) {
            return Err(TopologyError::NotInCommittee(local_node_id));
        }
        Ok(Self {
            local_node_id,
            members: seen.into_iter().collect(),
        })
    }

    /// Committee of ids `0..n` as seen from `local`.
    pub fn with_size(local: NodeId, n: u64) -> Result<Self, TopologyError> {
        Self::new(local, (0..n).map(NodeId).collect())
    }

    pub fn into_arc(self) -> Arc<dyn Topology> {
        Arc::new(self)
    }
}

impl Topology for StaticTopology {
    fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    fn members(&self) -> &[NodeId] {
        &self.members
    }
}

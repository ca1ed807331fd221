//! Batches: the unit a node proposes at each of its rounds.

use crate::{signing, BatchRef, Coordinate, Hash, NodeId, Round, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A proposed batch of transactions at one coordinate.
///
/// `parents` are the batches the proposer had observed at strong quorum in
/// its previous round. They are the causal edges of the graph.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub node: NodeId,
    pub round: Round,
    pub parents: Vec<BatchRef>,
    pub transactions: Vec<TxId>,
}

impl Batch {
    /// Build a batch. Parents are stored sorted so equal content always
    /// hashes the same.
    pub fn new(node: NodeId, round: Round, mut parents: Vec<BatchRef>, transactions: Vec<TxId>) -> Self {
        parents.sort();
        Self {
            node,
            round,
            parents,
            transactions,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.node, self.round)
    }

    pub fn hash(&self) -> Hash {
        Hash::from_bytes(&signing::batch_content_bytes(self))
    }

    pub fn batch_ref(&self) -> BatchRef {
        BatchRef::new(self.coordinate(), self.hash())
    }

    /// Structural checks that need no knowledge of other batches.
    pub fn validate(&self, limits: &BatchLimits) -> Result<(), BatchError> {
        if self.round.is_zero() {
            return Err(BatchError::ZeroRound);
        }
        if self.transactions.len() > limits.max_transactions {
            return Err(BatchError::TooManyTransactions {
                count: self.transactions.len(),
                max: limits.max_transactions,
            });
        }
        if self.parents.len() > limits.max_parents {
            return Err(BatchError::TooManyParents {
                count: self.parents.len(),
                max: limits.max_parents,
            });
        }

        let mut seen_nodes = BTreeSet::new();
        for parent in &self.parents {
            if parent.round() >= self.round {
                return Err(BatchError::CausalViolation {
                    coordinate: self.coordinate(),
                    parent: parent.coordinate,
                });
            }
            if !seen_nodes.insert((parent.node(), parent.round())) {
                return Err(BatchError::DuplicateParent(parent.coordinate));
            }
        }

        let unique_txs: BTreeSet<_> = self.transactions.iter().collect();
        if unique_txs.len() != self.transactions.len() {
            return Err(BatchError::DuplicateTransaction);
        }

        Ok(())
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("node", &self.node)
            .field("round", &self.round)
            .field("parents", &self.parents.len())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

/// Size limits applied to every batch, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_transactions: usize,
    pub max_parents: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_transactions: 512,
            max_parents: 64,
        }
    }
}

/// Reasons a batch is structurally invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("batch at round 0")]
    ZeroRound,

    #[error("{coordinate} references parent {parent} at the same or a later round")]
    CausalViolation {
        coordinate: Coordinate,
        parent: Coordinate,
    },

    #[error("parent {0} referenced more than once")]
    DuplicateParent(Coordinate),

    #[error("duplicate transaction in batch")]
    DuplicateTransaction,

    #[error("{count} parents exceeds the limit of {max}")]
    TooManyParents { count: usize, max: usize },

    #[error("{count} transactions exceeds the limit of {max}")]
    TooManyTransactions { count: usize, max: usize },
}

/// One position of the committed prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub position: u64,
    pub coordinate: Coordinate,
    pub hash: Hash,
    pub batch: Arc<Batch>,
}

impl CommittedEntry {
    pub fn batch_ref(&self) -> BatchRef {
        BatchRef::new(self.coordinate, self.hash)
    }
}

impl fmt::Debug for CommittedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittedEntry")
            .field("position", &self.position)
            .field("coordinate", &self.coordinate)
            .field("hash", &self.hash)
            .field("transactions", &self.batch.transactions.len())
            .finish()
    }
}

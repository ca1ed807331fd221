//! Causal graph of batches.
//!
//! Vertices are batches, edges point from a batch to the parents it
//! references. Parents may arrive after their children; such edges wait in
//! a pending set until the parent batch is inserted.

use blockmania_types::{Batch, BatchRef, Coordinate, NodeId, Round};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Reasons a batch cannot enter the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("{child} references {parent} at the same or a later round")]
    CausalViolation { child: Coordinate, parent: Coordinate },
}

/// Result of a successful insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted {
        /// Whether every direct parent is already present.
        resolved: bool,
        /// Children whose last missing parent was this batch.
        unblocked: Vec<BatchRef>,
    },
    AlreadyKnown,
}

/// The first vertex a history walk needed but did not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryGap(pub BatchRef);

#[derive(Debug, Default)]
pub struct CausalGraph {
    vertices: BTreeMap<BatchRef, Arc<Batch>>,
    /// parent -> children that reference it. The parent may be absent.
    children: BTreeMap<BatchRef, BTreeSet<BatchRef>>,
    /// child -> parents it references that have not arrived.
    pending: BTreeMap<BatchRef, BTreeSet<BatchRef>>,
    /// Rounds below this were pruned and count as settled.
    floor: Round,
}

impl CausalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a batch and resolve any edges that were waiting for it.
    pub fn insert(&mut self, batch: Arc<Batch>) -> Result<InsertOutcome, GraphError> {
        let batch_ref = batch.batch_ref();
        if self.vertices.contains_key(&batch_ref) {
            return Ok(InsertOutcome::AlreadyKnown);
        }
        if let Some(parent) = batch.parents.iter().find(|p| p.round() >= batch.round) {
            return Err(GraphError::CausalViolation {
                child: batch.coordinate(),
                parent: parent.coordinate,
            });
        }

        let mut missing = BTreeSet::new();
        for parent in &batch.parents {
            self.children.entry(*parent).or_default().insert(batch_ref);
            if parent.round() >= self.floor && !self.vertices.contains_key(parent) {
                missing.insert(*parent);
            }
        }
        let resolved = missing.is_empty();
        if !resolved {
            self.pending.insert(batch_ref, missing);
        }
        self.vertices.insert(batch_ref, batch);

        let mut unblocked = Vec::new();
        if let Some(children) = self.children.get(&batch_ref) {
            for child in children {
                if let Some(waiting) = self.pending.get_mut(child) {
                    waiting.remove(&batch_ref);
                    if waiting.is_empty() {
                        self.pending.remove(child);
                        unblocked.push(*child);
                    }
                }
            }
        }

        Ok(InsertOutcome::Inserted {
            resolved,
            unblocked,
        })
    }

    pub fn contains(&self, batch_ref: &BatchRef) -> bool {
        self.vertices.contains_key(batch_ref)
    }

    pub fn batch(&self, batch_ref: &BatchRef) -> Option<&Arc<Batch>> {
        self.vertices.get(batch_ref)
    }

    /// Present with every direct parent present.
    pub fn is_resolved(&self, batch_ref: &BatchRef) -> bool {
        self.contains(batch_ref) && !self.pending.contains_key(batch_ref)
    }

    /// Parents of `batch_ref` that have not arrived.
    pub fn missing_parents(&self, batch_ref: &BatchRef) -> Vec<BatchRef> {
        self.pending
            .get(batch_ref)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of edges still waiting for their parent.
    pub fn pending_edge_count(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    /// Every batch `root` transitively depends on, `root` included.
    ///
    /// `settled` marks batches whose own history is already accounted for;
    /// the walk neither includes nor descends into them. Pruned rounds are
    /// always settled.
    pub fn history(
        &self,
        root: BatchRef,
        settled: impl Fn(&BatchRef) -> bool,
    ) -> Result<BTreeSet<BatchRef>, HistoryGap> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if current.round() < self.floor || settled(&current) || !seen.insert(current) {
                continue;
            }
            let batch = self.vertices.get(&current).ok_or(HistoryGap(current))?;
            stack.extend(batch.parents.iter().copied());
        }
        Ok(seen)
    }

    /// Whether `target` is in the history of `from`.
    pub fn reaches(&self, from: BatchRef, target: BatchRef) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if current.round() <= target.round() || !seen.insert(current) {
                continue;
            }
            if let Some(batch) = self.vertices.get(&current) {
                stack.extend(batch.parents.iter().copied());
            }
        }
        false
    }

    /// Present batches in the round after `anchor` that reference it and
    /// satisfy `counted`.
    pub fn supporters(&self, anchor: &BatchRef, counted: impl Fn(&BatchRef) -> bool) -> Vec<BatchRef> {
        let vote_round = anchor.round().next();
        self.children
            .get(anchor)
            .into_iter()
            .flatten()
            .filter(|child| child.round() == vote_round)
            .filter(|child| self.vertices.contains_key(*child) && counted(*child))
            .copied()
            .collect()
    }

    /// Highest round at or below `round` that holds a batch.
    pub fn populated_round_at_or_below(&self, round: Round) -> Option<Round> {
        let end = round_start(round.next());
        let below = if end.round() > round {
            self.vertices.range(..end).next_back()
        } else {
            self.vertices.iter().next_back()
        };
        below.map(|(batch_ref, _)| batch_ref.round())
    }

    /// Lowest round at or above `round` that holds a batch.
    pub fn populated_round_at_or_above(&self, round: Round) -> Option<Round> {
        self.vertices
            .range(round_start(round)..)
            .next()
            .map(|(batch_ref, _)| batch_ref.round())
    }

    /// Highest round with any batch.
    pub fn max_round(&self) -> Round {
        self.vertices
            .keys()
            .next_back()
            .map_or(Round::ZERO, BatchRef::round)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn floor(&self) -> Round {
        self.floor
    }

    /// Drop every batch below `round`. Edges into pruned rounds count as
    /// resolved from now on.
    pub fn prune_below(&mut self, round: Round) -> usize {
        if round <= self.floor {
            return 0;
        }
        self.floor = round;
        let boundary = round_start(round);

        let kept = self.vertices.split_off(&boundary);
        let dropped = self.vertices.len();
        self.vertices = kept;

        self.children = self.children.split_off(&boundary);
        self.pending = self.pending.split_off(&boundary);
        self.pending.retain(|_, missing| {
            missing.retain(|parent| parent.round() >= round);
            !missing.is_empty()
        });
        dropped
    }
}

/// Smallest possible key at `round`.
fn round_start(round: Round) -> BatchRef {
    BatchRef::new(Coordinate::new(NodeId(0), round), Default::default())
}

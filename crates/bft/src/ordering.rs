//! Deterministic ordering of the causal graph into a committed prefix.
//!
//! Odd rounds carry an anchor: the batch of that round's designated leader.
//! Batches of the following round vote for an anchor simply by listing it
//! as a parent. Once enough strong votes are visible the anchor is decided,
//! and its not-yet-committed history is appended in (round, node, hash)
//! order.
//!
//! Anchors a node skipped because it had not seen their votes are picked up
//! through the history of the next decided anchor. Any anchor that some node
//! decided directly is reachable from every later anchor, because each batch
//! references a strong quorum of the previous round and those quorums
//! intersect the anchor's voters. All nodes therefore walk the same anchor
//! sequence and build the same prefix, whatever order messages arrived in.

use crate::graph::CausalGraph;
use crate::round_log::RoundLog;
use blockmania_types::{Batch, BatchRef, CommittedEntry, Coordinate, Hash, Round, Topology};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// The append-only committed sequence.
#[derive(Debug, Default)]
pub struct CommittedPrefix {
    entries: Vec<CommittedEntry>,
    coordinates: BTreeSet<Coordinate>,
}

impl CommittedPrefix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CommittedEntry] {
        &self.entries
    }

    pub fn get(&self, position: u64) -> Option<&CommittedEntry> {
        self.entries.get(position as usize)
    }

    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        self.coordinates.contains(coordinate)
    }

    /// Hash of the last committed batch, or [`Hash::NIL`] before the first.
    pub fn last_hash(&self) -> Hash {
        self.entries.last().map_or(Hash::NIL, |entry| entry.hash)
    }

    fn append(&mut self, batch_ref: BatchRef, batch: Arc<Batch>) -> CommittedEntry {
        let newly_committed = self.coordinates.insert(batch_ref.coordinate);
        debug_assert!(newly_committed, "{} committed twice", batch_ref.coordinate);
        let entry = CommittedEntry {
            position: self.entries.len() as u64,
            coordinate: batch_ref.coordinate,
            hash: batch_ref.hash,
            batch,
        };
        self.entries.push(entry.clone());
        entry
    }
}

/// Strong votes an anchor needs before it is decided.
///
/// Any strong quorum of the vote round must overlap the voters, so this is
/// `n - q + 1`. For `n = 3f + 1` that is `f + 1`.
pub fn decision_threshold(topology: &dyn Topology) -> usize {
    topology.committee_size() - topology.strong_quorum() + 1
}

/// Rounds of history an anchor may reach back into.
const DEFAULT_GC_DEPTH: u64 = 64;

/// Walks decided anchors and extends the committed prefix.
#[derive(Debug)]
pub struct OrderingEngine {
    prefix: CommittedPrefix,
    last_anchor_round: Round,
    /// Batches more than this many rounds below an anchor are never part of
    /// its history. The cut depends only on the anchor, so pruning older
    /// rounds cannot make two nodes disagree.
    gc_depth: u64,
}

impl Default for OrderingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderingEngine {
    pub fn new() -> Self {
        Self {
            prefix: CommittedPrefix::new(),
            last_anchor_round: Round::ZERO,
            gc_depth: DEFAULT_GC_DEPTH,
        }
    }

    pub fn with_gc_depth(mut self, rounds: u64) -> Self {
        self.gc_depth = rounds;
        self
    }

    /// Lowest round still eligible for the history of an anchor at `round`.
    pub fn history_floor(&self, round: Round) -> Round {
        Round(round.0.saturating_sub(self.gc_depth))
    }

    pub fn prefix(&self) -> &CommittedPrefix {
        &self.prefix
    }

    /// Round of the most recently decided anchor, zero before the first.
    pub fn last_anchor_round(&self) -> Round {
        self.last_anchor_round
    }

    fn next_anchor_round(&self) -> Round {
        if self.last_anchor_round.is_zero() {
            Round::GENESIS
        } else {
            Round(self.last_anchor_round.0 + 2)
        }
    }

    /// Run an ordering pass. Returns the newly committed entries in order.
    ///
    /// Idle when nothing new can be decided. Calling it again with the same
    /// inputs is a no-op.
    pub fn evaluate(
        &mut self,
        log: &RoundLog,
        graph: &CausalGraph,
        topology: &dyn Topology,
    ) -> Vec<CommittedEntry> {
        let mut committed = Vec::new();
        let max_round = graph.max_round();
        let mut from = self.next_anchor_round();

        while let Some(round) =
            populated_anchor_round(from, graph, topology).filter(|round| *round < max_round)
        {
            if let Some(anchor) = self.decided_anchor(round, log, graph, topology) {
                match self.commit_anchor(anchor, log, graph, topology) {
                    Some(entries) => {
                        debug!(
                            anchor = %anchor,
                            entries = entries.len(),
                            prefix_len = self.prefix.len(),
                            "Anchor decided"
                        );
                        committed.extend(entries);
                        self.last_anchor_round = round;
                    }
                    None => {
                        trace!(anchor = %anchor, "Anchor decided but history incomplete");
                        break;
                    }
                }
            }
            from = Round(round.0.saturating_add(2));
        }

        committed
    }

    /// The anchor of `round`, if it is strong and has enough strong votes.
    fn decided_anchor(
        &self,
        round: Round,
        log: &RoundLog,
        graph: &CausalGraph,
        topology: &dyn Topology,
    ) -> Option<BatchRef> {
        let coordinate = Coordinate::new(topology.leader_for(round), round);
        let anchor = BatchRef::new(coordinate, log.strong_hash(&coordinate)?);
        if !graph.contains(&anchor) {
            return None;
        }
        let votes = graph.supporters(&anchor, |voter| log.is_strong(voter)).len();
        (votes >= decision_threshold(topology)).then_some(anchor)
    }

    /// Commit `anchor` together with every earlier undecided anchor it
    /// reaches. Returns `None` without side effects if some batch of any of
    /// their histories is missing or not yet strong.
    fn commit_anchor(
        &mut self,
        anchor: BatchRef,
        log: &RoundLog,
        graph: &CausalGraph,
        topology: &dyn Topology,
    ) -> Option<Vec<CommittedEntry>> {
        let cutoff = self.history_floor(anchor.round());
        let history = graph
            .history(anchor, |r| r.round() < cutoff || self.prefix.contains(&r.coordinate))
            .ok()?;
        if !history.iter().all(|r| log.is_strong(r)) {
            return None;
        }

        let lowest = self.next_anchor_round();
        let mut chain = vec![anchor];
        let mut current = anchor;
        let mut round = anchor.round();
        while round.0 >= lowest.0 + 2 {
            round = Round(round.0 - 2);
            let coordinate = Coordinate::new(topology.leader_for(round), round);
            let Some(hash) = log.strong_hash(&coordinate) else {
                continue;
            };
            let earlier = BatchRef::new(coordinate, hash);
            if history.contains(&earlier) && graph.reaches(current, earlier) {
                chain.push(earlier);
                current = earlier;
            }
        }

        // Earlier anchors reach further back than `anchor` itself, so every
        // part is checked before anything is appended.
        let mut staged: Vec<(BatchRef, Arc<Batch>)> = Vec::with_capacity(history.len());
        let mut included = BTreeSet::new();
        for decided in chain.into_iter().rev() {
            let cutoff = self.history_floor(decided.round());
            let part = graph
                .history(decided, |r| {
                    r.round() < cutoff
                        || self.prefix.contains(&r.coordinate)
                        || included.contains(&r.coordinate)
                })
                .ok()?;
            for batch_ref in part {
                if !log.is_strong(&batch_ref) {
                    return None;
                }
                let batch = Arc::clone(graph.batch(&batch_ref)?);
                included.insert(batch_ref.coordinate);
                staged.push((batch_ref, batch));
            }
        }

        Some(
            staged
                .into_iter()
                .map(|(batch_ref, batch)| self.prefix.append(batch_ref, batch))
                .collect(),
        )
    }
}

/// First anchor round at or after `from` that holds any batch.
fn populated_anchor_round(
    from: Round,
    graph: &CausalGraph,
    topology: &dyn Topology,
) -> Option<Round> {
    let mut round = from;
    loop {
        let present = graph.populated_round_at_or_above(round)?;
        if topology.is_anchor_round(present) {
            return Some(present);
        }
        round = present.next();
    }
}

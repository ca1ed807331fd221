//! Per-coordinate message log with equivocation detection and quorum
//! tracking.
//!
//! The log is the only owner of recorded messages. Everything else reads
//! quorum status and strong hashes from it.

use blockmania_types::{BatchRef, Coordinate, Hash, Message, MessageKind, NodeId, Round, View};
use std::collections::{BTreeMap, BTreeSet};

/// Result of recording a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First message under its uniqueness key.
    Accepted,
    /// Exact repeat of an already recorded attestation. No state changed.
    DuplicateIgnored,
    /// The sender already signed a different hash under the same key. The
    /// message is still recorded and the sender is marked suspect.
    EquivocationDetected { first: Hash },
}

/// Quorum reached by a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QuorumStatus {
    #[default]
    None,
    Weak,
    Strong,
}

/// (kind, sender, view-for-view-changes).
///
/// Prepare, commit and pre-prepare carry their view for information only,
/// so a sender gets one of each per coordinate regardless of view. A
/// view-change is unique per target view because escalation legitimately
/// produces several from the same sender and round.
type UniquenessKey = (MessageKind, NodeId, Option<View>);

fn uniqueness_key(message: &Message) -> UniquenessKey {
    let view = match message.kind() {
        MessageKind::ViewChange => Some(message.view()),
        _ => None,
    };
    (message.kind(), message.sender(), view)
}

/// Everything recorded about one coordinate.
#[derive(Debug, Default)]
pub struct RoundSlot {
    messages: Vec<Message>,
    first_by_key: BTreeMap<UniquenessKey, Hash>,
    attestations: BTreeMap<(MessageKind, Hash), BTreeSet<NodeId>>,
    status: QuorumStatus,
    strong_hash: Option<Hash>,
    committed: bool,
}

impl RoundSlot {
    /// Every recorded message, conflicting ones included, in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> QuorumStatus {
        self.status
    }

    pub fn strong_hash(&self) -> Option<Hash> {
        self.strong_hash
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Distinct senders that signed `(kind, hash)` here.
    pub fn attesters(&self, kind: MessageKind, hash: Hash) -> usize {
        self.attestations
            .get(&(kind, hash))
            .map_or(0, BTreeSet::len)
    }

    fn refresh_status(&mut self, strong_quorum: usize, weak_quorum: usize) {
        // Counting is monotone: senders are only ever added. Strong stays
        // strong and the first strong hash is kept.
        for ((kind, hash), senders) in &self.attestations {
            if !kind.is_attestation() {
                continue;
            }
            if senders.len() >= strong_quorum {
                if self.strong_hash.is_none() {
                    self.strong_hash = Some(*hash);
                }
                self.status = QuorumStatus::Strong;
            } else if senders.len() >= weak_quorum && self.status == QuorumStatus::None {
                self.status = QuorumStatus::Weak;
            }
        }
    }
}

/// Log of every message, keyed by the coordinate it is about.
#[derive(Debug)]
pub struct RoundLog {
    slots: BTreeMap<Coordinate, RoundSlot>,
    suspects: BTreeSet<NodeId>,
    strong_quorum: usize,
    weak_quorum: usize,
    floor: Round,
}

impl RoundLog {
    pub fn new(strong_quorum: usize, weak_quorum: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            suspects: BTreeSet::new(),
            strong_quorum,
            weak_quorum,
            floor: Round::ZERO,
        }
    }

    /// Record a verified message.
    ///
    /// Every attestation is kept, including an equivocator's second one.
    /// Quorum counts distinct senders per (kind, hash), so the result does
    /// not depend on which of two conflicting messages arrived first.
    pub fn record(&mut self, message: Message) -> RecordOutcome {
        let kind = message.kind();
        let sender = message.sender();
        let hash = message.hash();
        let slot = self.slots.entry(message.node_round()).or_default();

        let attested = slot
            .attestations
            .get(&(kind, hash))
            .is_some_and(|attesters| attesters.contains(&sender));
        if kind != MessageKind::ViewChange && attested {
            return RecordOutcome::DuplicateIgnored;
        }

        let key = uniqueness_key(&message);
        let outcome = match slot.first_by_key.get(&key) {
            Some(first) if *first == hash => return RecordOutcome::DuplicateIgnored,
            Some(first) => RecordOutcome::EquivocationDetected { first: *first },
            None => {
                slot.first_by_key.insert(key, hash);
                RecordOutcome::Accepted
            }
        };

        slot.attestations.entry((kind, hash)).or_default().insert(sender);
        slot.messages.push(message);
        slot.refresh_status(self.strong_quorum, self.weak_quorum);

        if matches!(outcome, RecordOutcome::EquivocationDetected { .. }) {
            self.suspects.insert(sender);
        }
        outcome
    }

    pub fn slot(&self, coordinate: &Coordinate) -> Option<&RoundSlot> {
        self.slots.get(coordinate)
    }

    pub fn messages(&self, coordinate: &Coordinate) -> &[Message] {
        self.slots
            .get(coordinate)
            .map_or(&[], |slot| slot.messages())
    }

    pub fn quorum_status(&self, coordinate: &Coordinate) -> QuorumStatus {
        self.slots
            .get(coordinate)
            .map_or(QuorumStatus::None, RoundSlot::status)
    }

    /// The hash that reached strong quorum at `coordinate`, if any.
    pub fn strong_hash(&self, coordinate: &Coordinate) -> Option<Hash> {
        self.slots.get(coordinate).and_then(RoundSlot::strong_hash)
    }

    /// Whether `batch_ref` is the strong content of its coordinate.
    pub fn is_strong(&self, batch_ref: &BatchRef) -> bool {
        self.strong_hash(&batch_ref.coordinate) == Some(batch_ref.hash)
    }

    /// Strong batches at exactly `round`, in coordinate order.
    pub fn strong_at_round(&self, round: Round) -> Vec<BatchRef> {
        let start = Coordinate::new(NodeId(0), round);
        let end = Coordinate::new(NodeId(0), round.next());
        self.slots
            .range(start..end)
            .filter_map(|(coordinate, slot)| {
                slot.strong_hash().map(|hash| BatchRef::new(*coordinate, hash))
            })
            .collect()
    }

    /// Highest round holding a strong coordinate, zero if none.
    pub fn highest_strong_round(&self) -> Round {
        self.slots
            .iter()
            .rev()
            .find(|(_, slot)| slot.strong_hash().is_some())
            .map_or(Round::ZERO, |(coordinate, _)| coordinate.round)
    }

    /// The hash `sender` first signed as `kind` at `coordinate`.
    pub fn first_attestation(
        &self,
        coordinate: &Coordinate,
        kind: MessageKind,
        sender: NodeId,
    ) -> Option<Hash> {
        self.slots
            .get(coordinate)?
            .first_by_key
            .get(&(kind, sender, None))
            .copied()
    }

    pub fn suspects(&self) -> &BTreeSet<NodeId> {
        &self.suspects
    }

    pub fn is_suspect(&self, node: NodeId) -> bool {
        self.suspects.contains(&node)
    }

    pub fn mark_committed(&mut self, coordinate: &Coordinate) {
        if let Some(slot) = self.slots.get_mut(coordinate) {
            slot.committed = true;
        }
    }

    pub fn is_committed(&self, coordinate: &Coordinate) -> bool {
        self.slots
            .get(coordinate)
            .is_some_and(RoundSlot::is_committed)
    }

    /// Lowest round still held.
    pub fn floor(&self) -> Round {
        self.floor
    }

    /// Drop every slot below `round`. Returns how many were dropped.
    pub fn prune_below(&mut self, round: Round) -> usize {
        if round <= self.floor {
            return 0;
        }
        self.floor = round;
        let keep = self.slots.split_off(&Coordinate::new(NodeId(0), round));
        let dropped = self.slots.len();
        self.slots = keep;
        dropped
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

//! Blockmania consensus state machine.
//!
//! This module composes the round log, causal graph, ordering engine and
//! view-change machine into one synchronous, event-driven component.
//!
//! Every round each member proposes one batch that references a strong
//! quorum of the previous round. Members prepare the first valid proposal
//! they see for each coordinate, commit once a coordinate has strong
//! prepares, and order the graph whenever something changes.

use crate::config::BftConfig;
use crate::graph::{CausalGraph, GraphError, InsertOutcome};
use crate::ordering::{CommittedPrefix, OrderingEngine};
use crate::round_log::{RecordOutcome, RoundLog};
use crate::view_change::{ViewChangeOutput, ViewChangeState};
use blockmania_core::{
    Action, ConsensusEvent, Event, OutboundMessage, RejectReason, SubStateMachine, TimerId,
};
use blockmania_mempool::Mempool;
use blockmania_messages::{ProposalGossip, StatementGossip};
use blockmania_types::{
    Batch, BatchError, BatchRef, Coordinate, Crypto, Hash, Message, MessageKind, NodeId, Round,
    Signature, Topology, View,
};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// BFT statistics for monitoring.
#[derive(Clone, Copy, Debug, Default)]
pub struct BftStats {
    /// Highest round the local node proposed in.
    pub own_round: u64,
    /// Current view.
    pub view: u32,
    /// Length of the committed prefix.
    pub committed: u64,
    /// Views adopted since start.
    pub view_changes: u64,
    /// Equivocations observed.
    pub equivocations: u64,
    /// Inbound messages dropped.
    pub rejected: u64,
    /// Causal edges still waiting for their parent batch.
    pub pending_edges: usize,
}

/// Consensus state for one committee member.
pub struct BlockmaniaState {
    // ═══════════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════════
    topology: Arc<dyn Topology>,
    crypto: Arc<dyn Crypto>,
    config: BftConfig,

    // ═══════════════════════════════════════════════════════════════════════════
    // Consensus components
    // ═══════════════════════════════════════════════════════════════════════════
    log: RoundLog,
    graph: CausalGraph,
    ordering: OrderingEngine,
    view_change: ViewChangeState,

    // ═══════════════════════════════════════════════════════════════════════════
    // Voting
    // ═══════════════════════════════════════════════════════════════════════════
    /// Highest round the local node proposed in.
    own_round: Round,

    /// First valid proposal seen per coordinate. Only this one is prepared.
    first_proposals: BTreeMap<Coordinate, Hash>,

    /// Vote lock: the hash the local node prepared per coordinate.
    prepared: BTreeMap<Coordinate, Hash>,

    /// First proposals whose parents are not yet all strong and present.
    awaiting_prepare: BTreeSet<BatchRef>,

    /// Coordinates with attestations that have not been committed to yet.
    commit_candidates: BTreeSet<Coordinate>,

    /// Coordinates the local node sent a commit for.
    commits_sent: BTreeSet<Coordinate>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Statistics
    // ═══════════════════════════════════════════════════════════════════════════
    view_changes: u64,
    equivocations: u64,
    rejected: u64,

    now: Duration,
}

impl std::fmt::Debug for BlockmaniaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockmaniaState")
            .field("node", &self.topology.local_node_id())
            .field("own_round", &self.own_round)
            .field("view", &self.view_change.view())
            .field("committed", &self.ordering.prefix().len())
            .field("graph", &self.graph.len())
            .field("awaiting_prepare", &self.awaiting_prepare.len())
            .finish()
    }
}

impl BlockmaniaState {
    pub fn new(topology: Arc<dyn Topology>, crypto: Arc<dyn Crypto>, config: BftConfig) -> Self {
        let log = RoundLog::new(topology.strong_quorum(), topology.weak_quorum());
        let view_change = ViewChangeState::new(Arc::clone(&topology), &config);
        let ordering = OrderingEngine::new().with_gc_depth(config.gc_depth);
        Self {
            topology,
            crypto,
            config,
            log,
            graph: CausalGraph::new(),
            ordering,
            view_change,
            own_round: Round::ZERO,
            first_proposals: BTreeMap::new(),
            prepared: BTreeMap::new(),
            awaiting_prepare: BTreeSet::new(),
            commit_candidates: BTreeSet::new(),
            commits_sent: BTreeSet::new(),
            view_changes: 0,
            equivocations: 0,
            rejected: 0,
            now: Duration::ZERO,
        }
    }

    /// Arm the recurring timers.
    pub fn initialize(&mut self) -> Vec<Action> {
        info!(
            node = %self.local_node_id(),
            committee = self.topology.committee_size(),
            strong_quorum = self.topology.strong_quorum(),
            "Consensus starting"
        );
        vec![
            Action::SetTimer {
                id: TimerId::Proposal,
                duration: self.config.proposal_interval,
            },
            Action::SetTimer {
                id: TimerId::ViewChange,
                duration: self.config.view_change_check_interval,
            },
            Action::SetTimer {
                id: TimerId::Cleanup,
                duration: self.config.cleanup_interval,
            },
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn local_node_id(&self) -> NodeId {
        self.topology.local_node_id()
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn view(&self) -> View {
        self.view_change.view()
    }

    pub fn own_round(&self) -> Round {
        self.own_round
    }

    pub fn prefix(&self) -> &CommittedPrefix {
        self.ordering.prefix()
    }

    pub fn log(&self) -> &RoundLog {
        &self.log
    }

    pub fn graph(&self) -> &CausalGraph {
        &self.graph
    }

    pub fn view_change(&self) -> &ViewChangeState {
        &self.view_change
    }

    pub fn stats(&self) -> BftStats {
        BftStats {
            own_round: self.own_round.0,
            view: self.view_change.view().0,
            committed: self.ordering.prefix().len() as u64,
            view_changes: self.view_changes,
            equivocations: self.equivocations,
            rejected: self.rejected,
            pending_edges: self.graph.pending_edge_count(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle the proposal timer: propose the next batch if the local round
    /// may advance.
    ///
    /// The mempool is passed in by the node so consensus never owns it.
    #[instrument(skip(self, mempool), fields(
        node = %self.local_node_id(),
        own_round = self.own_round.0,
        pool = mempool.count()
    ))]
    pub fn on_proposal_timer(&mut self, mempool: &mut dyn Mempool) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Proposal,
            duration: self.config.proposal_interval,
        }];

        let Some((round, parents)) = self.next_proposal() else {
            return actions;
        };

        let local = self.local_node_id();
        let transactions = mempool.next_batch(self.config.max_batch_size);
        let batch = Arc::new(Batch::new(local, round, parents, transactions));
        let message = Message::pre_prepare(batch.hash(), local, round, self.view());
        let signature = self.sign(&message);

        info!(
            round = round.0,
            hash = %batch.hash(),
            parents = batch.parents.len(),
            txs = batch.transactions.len(),
            "Proposing batch"
        );

        self.own_round = round;
        self.view_change.on_progress();

        let gossip = ProposalGossip::new(message, batch, signature);
        actions.push(Action::Broadcast {
            message: OutboundMessage::Proposal(gossip.clone()),
        });
        actions.extend(self.on_proposal(gossip));
        actions
    }

    /// Round to propose next and its parents, or `None` while waiting.
    ///
    /// A node may propose at `r` once it sees a strong quorum of present,
    /// strong batches at `r - 1`. If `r - 1` carries an anchor, that anchor
    /// must be among them unless a view change released it. A node that fell
    /// behind skips straight to the highest round it can build on.
    fn next_proposal(&mut self) -> Option<(Round, Vec<BatchRef>)> {
        if self.own_round.is_zero() {
            return Some((Round::GENESIS, Vec::new()));
        }

        let quorum = self.topology.strong_quorum();
        let mut previous = self.graph.max_round();
        let parents = loop {
            if previous < self.own_round {
                trace!(own_round = self.own_round.0, "No strong quorum to build on");
                return None;
            }
            let parents = self.quorum_parents(previous);
            if parents.len() >= quorum {
                break parents;
            }
            match self.graph.populated_round_at_or_below(previous.prev()) {
                Some(lower) if lower < previous => previous = lower,
                _ => {
                    trace!(own_round = self.own_round.0, "No strong quorum to build on");
                    return None;
                }
            }
        };

        if self.topology.is_anchor_round(previous) {
            let anchor = Coordinate::new(self.topology.leader_for(previous), previous);
            let anchor_included = parents.iter().any(|p| p.coordinate == anchor);
            if !anchor_included && !self.view_change.is_released(previous) {
                trace!(anchor = %anchor, "Waiting for anchor");
                self.view_change.await_anchor(previous);
                return None;
            }
        }

        Some((previous.next(), parents))
    }

    /// Strong batches at `round` present in the graph.
    fn quorum_parents(&self, round: Round) -> Vec<BatchRef> {
        self.log
            .strong_at_round(round)
            .into_iter()
            .filter(|parent| self.graph.contains(parent))
            .take(self.config.max_parents)
            .collect()
    }

    fn sign(&self, message: &Message) -> Signature {
        self.crypto.sign(&message.signing_bytes())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Inbound proposals
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle a pre-prepare together with its batch.
    #[instrument(skip(self, gossip), fields(
        node = %self.local_node_id(),
        from = %gossip.message.sender(),
        round = gossip.message.round().0
    ))]
    pub fn on_proposal(&mut self, gossip: ProposalGossip) -> Vec<Action> {
        let (message, batch, signature) = gossip.into_parts();
        let sender = message.sender();

        if !self.topology.is_member(sender) {
            return self.reject(sender, RejectReason::UnknownSender);
        }
        if message.kind() != MessageKind::PrePrepare
            || message.node() != sender
            || message.node_round() != batch.coordinate()
            || message.hash() != batch.hash()
        {
            debug!(message = %message, "Proposal does not match its batch");
            return self.reject(sender, RejectReason::Malformed);
        }
        if let Err(err) = batch.validate(&self.config.batch_limits()) {
            debug!(error = %err, "Invalid batch");
            let reason = match err {
                BatchError::CausalViolation { .. } => RejectReason::CausalViolation,
                _ => RejectReason::Malformed,
            };
            return self.reject(sender, reason);
        }
        if !self.parents_well_formed(&batch) {
            debug!(batch = ?batch, "Batch parents do not cover a strong quorum of the previous round");
            return self.reject(sender, RejectReason::Malformed);
        }
        if !self
            .crypto
            .verify(sender, &message.signing_bytes(), &signature)
        {
            warn!(message = %message, "Invalid proposal signature");
            return self.reject(sender, RejectReason::BadSignature);
        }
        if batch.round < self.log.floor() {
            return self.reject(sender, RejectReason::Stale);
        }
        if batch.round > self.round_ceiling() {
            debug!(round = batch.round.0, ceiling = self.round_ceiling().0, "Proposal too far ahead");
            return self.reject(sender, RejectReason::TooFarAhead);
        }

        let batch_ref = batch.batch_ref();
        match self.graph.insert(batch) {
            Ok(InsertOutcome::Inserted { resolved, .. }) => {
                trace!(batch = %batch_ref, resolved, "Batch added to graph");
            }
            Ok(InsertOutcome::AlreadyKnown) => {}
            Err(GraphError::CausalViolation { child, parent }) => {
                debug!(child = %child, parent = %parent, "Causal violation");
                return self.reject(sender, RejectReason::CausalViolation);
            }
        }

        let mut actions = Vec::new();
        match self.log.record(message.clone()) {
            RecordOutcome::DuplicateIgnored => return actions,
            RecordOutcome::EquivocationDetected { first } => {
                actions.push(self.equivocation(&message, first));
            }
            RecordOutcome::Accepted => {}
        }

        if let Entry::Vacant(entry) = self.first_proposals.entry(batch_ref.coordinate) {
            entry.insert(batch_ref.hash);
            self.awaiting_prepare.insert(batch_ref);
        }

        actions.extend(self.advance());
        actions
    }

    /// Highest round an inbound message may be about.
    ///
    /// The frontier only moves with the local node's own proposals, decided
    /// anchors and coordinates that reached strong quorum, all of which need
    /// honest participation. Messages further ahead than `max_round_lead`
    /// are dropped.
    fn round_ceiling(&self) -> Round {
        let frontier = self
            .own_round
            .max(self.ordering.last_anchor_round())
            .max(self.log.highest_strong_round());
        Round(frontier.0.saturating_add(self.config.max_round_lead))
    }

    /// Parents must be members at exactly the previous round and, past the
    /// first round, at least a strong quorum of them.
    fn parents_well_formed(&self, batch: &Batch) -> bool {
        if batch.round == Round::GENESIS {
            return batch.parents.is_empty();
        }
        let previous = batch.round.prev();
        batch.parents.len() >= self.topology.strong_quorum()
            && batch
                .parents
                .iter()
                .all(|parent| parent.round() == previous && self.topology.is_member(parent.node()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Inbound statements
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle a prepare, commit or view-change.
    #[instrument(skip(self, gossip), fields(
        node = %self.local_node_id(),
        kind = gossip.message.kind().as_str(),
        from = %gossip.message.sender()
    ))]
    pub fn on_statement(&mut self, gossip: StatementGossip) -> Vec<Action> {
        let (message, signature) = gossip.into_parts();
        let sender = message.sender();

        if !self.topology.is_member(sender) {
            return self.reject(sender, RejectReason::UnknownSender);
        }
        let well_formed = match message.kind() {
            MessageKind::PrePrepare => false,
            MessageKind::Prepare | MessageKind::Commit => {
                self.topology.is_member(message.node()) && !message.round().is_zero()
            }
            MessageKind::ViewChange => message.node() == sender,
        };
        if !well_formed {
            debug!(message = %message, "Malformed statement");
            return self.reject(sender, RejectReason::Malformed);
        }
        if !self
            .crypto
            .verify(sender, &message.signing_bytes(), &signature)
        {
            warn!(message = %message, "Invalid statement signature");
            return self.reject(sender, RejectReason::BadSignature);
        }
        if message.round() < self.log.floor() {
            return self.reject(sender, RejectReason::Stale);
        }
        if message.round() > self.round_ceiling() {
            debug!(message = %message, ceiling = self.round_ceiling().0, "Statement too far ahead");
            return self.reject(sender, RejectReason::TooFarAhead);
        }

        let mut actions = Vec::new();
        match self.log.record(message.clone()) {
            RecordOutcome::DuplicateIgnored => return actions,
            RecordOutcome::EquivocationDetected { first } => {
                actions.push(self.equivocation(&message, first));
            }
            RecordOutcome::Accepted => {}
        }

        if message.kind() == MessageKind::ViewChange {
            let output = self.view_change.on_request(&message);
            actions.extend(self.apply_view_change(output));
            return actions;
        }

        let coordinate = message.node_round();
        if !self.commits_sent.contains(&coordinate) {
            self.commit_candidates.insert(coordinate);
        }
        actions.extend(self.advance());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Voting and ordering
    // ═══════════════════════════════════════════════════════════════════════════

    /// Send every prepare and commit that became possible, then order.
    fn advance(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let sent = self.send_ready_prepares(&mut actions) + self.send_ready_commits(&mut actions);
            if sent == 0 {
                break;
            }
        }
        self.order(&mut actions);
        actions
    }

    fn can_prepare(&self, batch_ref: &BatchRef) -> bool {
        let Some(batch) = self.graph.batch(batch_ref) else {
            return false;
        };
        batch.parents.iter().all(|parent| {
            parent.round() < self.graph.floor()
                || (self.graph.contains(parent) && self.log.is_strong(parent))
        })
    }

    fn send_ready_prepares(&mut self, actions: &mut Vec<Action>) -> usize {
        let ready: Vec<BatchRef> = self
            .awaiting_prepare
            .iter()
            .filter(|batch_ref| self.can_prepare(batch_ref))
            .copied()
            .collect();

        for batch_ref in &ready {
            self.awaiting_prepare.remove(batch_ref);
            if self.prepared.contains_key(&batch_ref.coordinate) {
                continue;
            }
            self.prepared.insert(batch_ref.coordinate, batch_ref.hash);
            trace!(batch = %batch_ref, "Preparing");
            let message = Message::prepare(
                batch_ref.hash,
                batch_ref.coordinate,
                self.local_node_id(),
                self.view(),
            );
            actions.push(self.send_statement(message));
        }
        ready.len()
    }

    fn send_ready_commits(&mut self, actions: &mut Vec<Action>) -> usize {
        let ready: Vec<(Coordinate, Hash)> = self
            .commit_candidates
            .iter()
            .filter_map(|coordinate| {
                self.log
                    .strong_hash(coordinate)
                    .map(|hash| (*coordinate, hash))
            })
            .collect();

        for (coordinate, hash) in &ready {
            self.commit_candidates.remove(coordinate);
            self.commits_sent.insert(*coordinate);
            trace!(coordinate = %coordinate, hash = %hash, "Committing");
            let message = Message::commit(*hash, *coordinate, self.local_node_id(), self.view());
            actions.push(self.send_statement(message));
        }
        ready.len()
    }

    /// Sign, record locally, then broadcast.
    fn send_statement(&mut self, message: Message) -> Action {
        let signature = self.sign(&message);
        if message.kind().is_attestation() && !self.commits_sent.contains(&message.node_round()) {
            self.commit_candidates.insert(message.node_round());
        }
        self.log.record(message.clone());
        Action::Broadcast {
            message: OutboundMessage::Statement(StatementGossip::new(message, signature)),
        }
    }

    fn order(&mut self, actions: &mut Vec<Action>) {
        let entries = self
            .ordering
            .evaluate(&self.log, &self.graph, self.topology.as_ref());
        if entries.is_empty() {
            return;
        }

        for entry in &entries {
            self.log.mark_committed(&entry.coordinate);
            actions.push(Action::EmitConsensusEvent {
                event: ConsensusEvent::Committed {
                    position: entry.position,
                    coordinate: entry.coordinate,
                    hash: entry.hash,
                },
            });
        }
        info!(
            committed = entries.len(),
            prefix_len = self.ordering.prefix().len(),
            anchor_round = self.ordering.last_anchor_round().0,
            "Prefix extended"
        );

        self.view_change.on_progress();
        actions.push(Action::EmitCommitted {
            entries: entries.clone(),
        });
        actions.push(Action::EnqueueInternal {
            event: Event::BatchesCommitted { entries },
        });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_view_change_timer(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::ViewChange,
            duration: self.config.view_change_check_interval,
        }];
        let last_safe = self.ordering.prefix().last_hash();
        let output = self.view_change.on_timer(last_safe, self.own_round);
        actions.extend(self.apply_view_change(output));
        actions
    }

    fn apply_view_change(&mut self, output: ViewChangeOutput) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(request) = output.request {
            actions.push(self.send_statement(request));
        }
        if output.adopted.is_some() {
            self.view_changes += 1;
        }
        actions.extend(
            output
                .events
                .into_iter()
                .map(|event| Action::EmitConsensusEvent { event }),
        );
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Cleanup
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drop state no future anchor can reach.
    fn on_cleanup_timer(&mut self) -> Vec<Action> {
        let actions = vec![Action::SetTimer {
            id: TimerId::Cleanup,
            duration: self.config.cleanup_interval,
        }];

        let floor = self
            .ordering
            .history_floor(self.ordering.last_anchor_round());
        if floor <= self.log.floor() {
            return actions;
        }

        let slots = self.log.prune_below(floor);
        let batches = self.graph.prune_below(floor);
        let split = Coordinate::new(NodeId(0), floor);
        self.first_proposals = self.first_proposals.split_off(&split);
        self.prepared = self.prepared.split_off(&split);
        self.commit_candidates = self.commit_candidates.split_off(&split);
        self.commits_sent = self.commits_sent.split_off(&split);
        self.awaiting_prepare.retain(|batch_ref| batch_ref.round() >= floor);

        debug!(floor = floor.0, slots, batches, "Pruned consensus state");
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Observability helpers
    // ═══════════════════════════════════════════════════════════════════════════

    fn reject(&mut self, sender: NodeId, reason: RejectReason) -> Vec<Action> {
        self.rejected += 1;
        debug!(sender = %sender, reason = reason.as_str(), "Message rejected");
        vec![Action::EmitConsensusEvent {
            event: ConsensusEvent::MessageRejected { sender, reason },
        }]
    }

    fn equivocation(&mut self, message: &Message, first: Hash) -> Action {
        self.equivocations += 1;
        warn!(
            sender = %message.sender(),
            coordinate = %message.node_round(),
            kind = message.kind().as_str(),
            first = %first,
            second = %message.hash(),
            "Equivocation detected"
        );
        Action::EmitConsensusEvent {
            event: ConsensusEvent::EquivocationDetected {
                sender: message.sender(),
                coordinate: message.node_round(),
                kind: message.kind(),
                first,
                second: message.hash(),
            },
        }
    }
}

impl SubStateMachine for BlockmaniaState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            // ProposalTimer needs the mempool; the node calls
            // `on_proposal_timer` directly.
            Event::ProposalReceived { gossip } => Some(self.on_proposal(gossip.clone())),
            Event::StatementReceived { gossip } => Some(self.on_statement(gossip.clone())),
            Event::ViewChangeTimer => Some(self.on_view_change_timer()),
            Event::CleanupTimer => Some(self.on_cleanup_timer()),
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.view_change.set_time(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round_log::QuorumStatus;
    use blockmania_mempool::{MempoolConfig, MempoolState};
    use blockmania_types::{Ed25519Keyring, StaticTopology, TxId};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tracing_test::traced_test;

    const KEY_SEED: u64 = 7;

    struct Committee {
        members: Vec<NodeId>,
        keys: Vec<Arc<dyn Crypto>>,
    }

    impl Committee {
        fn new(n: u64) -> Self {
            let members: Vec<NodeId> = (0..n).map(NodeId).collect();
            let keys = members
                .iter()
                .map(|id| Ed25519Keyring::deterministic(*id, &members, KEY_SEED).into_arc())
                .collect();
            Self { members, keys }
        }

        fn state(&self, local: u64) -> BlockmaniaState {
            self.state_with(local, BftConfig::default())
        }

        fn state_with(&self, local: u64, config: BftConfig) -> BlockmaniaState {
            let topology = StaticTopology::new(NodeId(local), self.members.clone())
                .unwrap()
                .into_arc();
            BlockmaniaState::new(topology, Arc::clone(&self.keys[local as usize]), config)
        }

        fn proposal(&self, node: u64, round: u64, parents: &[BatchRef]) -> ProposalGossip {
            let batch = Batch::new(
                NodeId(node),
                Round(round),
                parents.to_vec(),
                vec![TxId::for_payload(&[node as u8, round as u8])],
            );
            self.sign_proposal(batch)
        }

        fn sign_proposal(&self, batch: Batch) -> ProposalGossip {
            let message = Message::pre_prepare(batch.hash(), batch.node, batch.round, View::INITIAL);
            let signature = self.keys[batch.node.0 as usize].sign(&message.signing_bytes());
            ProposalGossip::new(message, Arc::new(batch), signature)
        }

        fn statement(&self, message: Message) -> StatementGossip {
            let signature = self.keys[message.sender().0 as usize].sign(&message.signing_bytes());
            StatementGossip::new(message, signature)
        }

        fn prepare(&self, sender: u64, batch_ref: BatchRef) -> StatementGossip {
            self.statement(Message::prepare(
                batch_ref.hash,
                batch_ref.coordinate,
                NodeId(sender),
                View::INITIAL,
            ))
        }

        /// Every proposal and prepare of `rounds` fault-free rounds, in
        /// delivery order.
        fn perfect_rounds(&self, rounds: u64) -> Vec<Event> {
            let mut events = Vec::new();
            let mut previous: Vec<BatchRef> = Vec::new();
            for round in 1..=rounds {
                let proposals: Vec<ProposalGossip> = self
                    .members
                    .iter()
                    .map(|node| self.proposal(node.0, round, &previous))
                    .collect();
                let refs: Vec<BatchRef> = proposals.iter().map(ProposalGossip::batch_ref).collect();
                events.extend(
                    proposals
                        .into_iter()
                        .map(|gossip| Event::ProposalReceived { gossip }),
                );
                for batch_ref in &refs {
                    for sender in &self.members {
                        events.push(Event::StatementReceived {
                            gossip: self.prepare(sender.0, *batch_ref),
                        });
                    }
                }
                previous = refs;
            }
            events
        }
    }

    fn deliver(state: &mut BlockmaniaState, events: &[Event]) -> Vec<Action> {
        events
            .iter()
            .flat_map(|event| state.try_handle(event).unwrap_or_default())
            .collect()
    }

    fn consensus_events(actions: &[Action]) -> Vec<ConsensusEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::EmitConsensusEvent { event } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn broadcast_statements(actions: &[Action], kind: MessageKind) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Broadcast {
                    message: OutboundMessage::Statement(gossip),
                } if gossip.message.kind() == kind => Some(gossip.message),
                _ => None,
            })
            .collect()
    }

    fn broadcast_proposal(actions: &[Action]) -> Option<ProposalGossip> {
        actions.iter().find_map(|action| match action {
            Action::Broadcast {
                message: OutboundMessage::Proposal(gossip),
            } => Some(gossip.clone()),
            _ => None,
        })
    }

    fn prefix_refs(state: &BlockmaniaState) -> Vec<BatchRef> {
        state
            .prefix()
            .entries()
            .iter()
            .map(|entry| entry.batch_ref())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_initialize_arms_timers() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let timers: Vec<TimerId> = state
            .initialize()
            .into_iter()
            .filter_map(|action| match action {
                Action::SetTimer { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(timers, vec![TimerId::Proposal, TimerId::ViewChange, TimerId::Cleanup]);
    }

    #[traced_test]
    #[test]
    fn test_first_proposal_has_no_parents() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let mut mempool = MempoolState::new(MempoolConfig::default());
        mempool.add(Arc::new(b"tx-a".to_vec())).unwrap();
        mempool.add(Arc::new(b"tx-b".to_vec())).unwrap();

        let actions = state.on_proposal_timer(&mut mempool);
        assert!(matches!(
            actions[0],
            Action::SetTimer {
                id: TimerId::Proposal,
                ..
            }
        ));

        let proposal = broadcast_proposal(&actions).expect("proposal broadcast");
        assert_eq!(proposal.batch.round, Round(1));
        assert!(proposal.batch.parents.is_empty());
        assert_eq!(proposal.batch.transactions.len(), 2);

        // The own prepare is recorded before it goes out.
        let prepares = broadcast_statements(&actions, MessageKind::Prepare);
        assert_eq!(prepares.len(), 1);
        assert_eq!(
            state
                .log()
                .first_attestation(&proposal.batch.coordinate(), MessageKind::Prepare, NodeId(0)),
            Some(proposal.batch.hash())
        );
        assert_eq!(state.own_round(), Round(1));
        assert!(logs_contain("Proposing batch"));

        // No strong quorum at round 1 yet.
        let actions = state.on_proposal_timer(&mut mempool);
        assert!(broadcast_proposal(&actions).is_none());
        assert_eq!(state.own_round(), Round(1));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Rejections
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_rejects_bad_signature() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let mut gossip = committee.proposal(1, 1, &[]);
        gossip.signature = committee.keys[2].sign(&gossip.message.signing_bytes());

        let actions = state.on_proposal(gossip);
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(1),
                reason: RejectReason::BadSignature
            }]
        );
        assert!(state.graph().is_empty());
        assert!(state.log().is_empty());
        assert_eq!(state.stats().rejected, 1);
    }

    #[test]
    fn test_rejects_unknown_sender() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let message = Message::prepare(
            Hash::from_bytes(b"batch"),
            Coordinate::new(NodeId(1), Round(1)),
            NodeId(9),
            View::INITIAL,
        );
        let actions = state.on_statement(StatementGossip::new(message, Signature::empty()));
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(9),
                reason: RejectReason::UnknownSender
            }]
        );
    }

    #[test]
    fn test_rejects_proposal_not_matching_batch() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let batch = Batch::new(NodeId(1), Round(1), vec![], vec![]);
        let message = Message::pre_prepare(Hash::from_bytes(b"other"), NodeId(1), Round(1), View::INITIAL);
        let signature = committee.keys[1].sign(&message.signing_bytes());

        let actions = state.on_proposal(ProposalGossip::new(message, Arc::new(batch), signature));
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(1),
                reason: RejectReason::Malformed
            }]
        );
    }

    #[test]
    fn test_rejects_pre_prepare_as_statement() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let message = Message::pre_prepare(Hash::from_bytes(b"batch"), NodeId(1), Round(1), View::INITIAL);
        let actions = state.on_statement(committee.statement(message));
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(1),
                reason: RejectReason::Malformed
            }]
        );
    }

    #[test]
    fn test_rejects_causal_violation() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let same_round = BatchRef::new(Coordinate::new(NodeId(0), Round(2)), Hash::from_bytes(b"x"));
        let gossip = committee.sign_proposal(Batch::new(NodeId(1), Round(2), vec![same_round], vec![]));

        let actions = state.on_proposal(gossip);
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(1),
                reason: RejectReason::CausalViolation
            }]
        );
        assert!(state.graph().is_empty());
    }

    #[test]
    fn test_rejects_rounds_far_above_frontier() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let forged_parents = |round: u64| -> Vec<BatchRef> {
            (0..3)
                .map(|n| {
                    BatchRef::new(
                        Coordinate::new(NodeId(n), Round(round)),
                        Hash::from_bytes(&[n as u8]),
                    )
                })
                .collect()
        };

        let actions = state.on_proposal(committee.proposal(3, u64::MAX, &forged_parents(u64::MAX - 1)));
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(3),
                reason: RejectReason::TooFarAhead
            }]
        );
        assert!(state.graph().is_empty());

        let far = BatchRef::new(Coordinate::new(NodeId(2), Round(1_000)), Hash::from_bytes(b"far"));
        let actions = state.on_statement(committee.prepare(3, far));
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(3),
                reason: RejectReason::TooFarAhead
            }]
        );
        assert!(state.log().is_empty());

        // A lead inside the window is still accepted and does not stall
        // proposing.
        let lead = state.config().max_round_lead;
        let actions = state.on_proposal(committee.proposal(3, lead, &forged_parents(lead - 1)));
        assert!(consensus_events(&actions).is_empty());
        assert_eq!(state.graph().max_round(), Round(lead));

        let mut mempool = MempoolState::new(MempoolConfig::default());
        let proposal = broadcast_proposal(&state.on_proposal_timer(&mut mempool)).unwrap();
        assert_eq!(proposal.batch.round, Round(1));
        assert!(broadcast_proposal(&state.on_proposal_timer(&mut mempool)).is_none());
    }

    #[test]
    fn test_duplicate_statement_ignored() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let batch_ref = committee.proposal(1, 1, &[]).batch_ref();
        let gossip = committee.prepare(2, batch_ref);

        state.on_statement(gossip.clone());
        let actions = state.on_statement(gossip);
        assert!(actions.is_empty());
        assert_eq!(
            state
                .log()
                .slot(&batch_ref.coordinate)
                .map(|slot| slot.attesters(MessageKind::Prepare, batch_ref.hash)),
            Some(1)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Voting
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_prepare_waits_for_strong_parents() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);

        let round_one: Vec<ProposalGossip> = (1..4).map(|n| committee.proposal(n, 1, &[])).collect();
        let refs: Vec<BatchRef> = round_one.iter().map(ProposalGossip::batch_ref).collect();
        for gossip in round_one {
            let actions = state.on_proposal(gossip);
            assert_eq!(broadcast_statements(&actions, MessageKind::Prepare).len(), 1);
        }

        let child = committee.proposal(1, 2, &refs);
        let child_ref = child.batch_ref();
        let actions = state.on_proposal(child);
        assert!(broadcast_statements(&actions, MessageKind::Prepare).is_empty());

        let mut actions = Vec::new();
        for batch_ref in &refs {
            for sender in [1, 2] {
                actions.extend(state.on_statement(committee.prepare(sender, *batch_ref)));
            }
        }

        let commits = broadcast_statements(&actions, MessageKind::Commit);
        assert_eq!(commits.len(), 3);
        let prepares = broadcast_statements(&actions, MessageKind::Prepare);
        assert_eq!(prepares.len(), 1);
        assert_eq!(prepares[0].node_round(), child_ref.coordinate);
        assert_eq!(prepares[0].hash(), child_ref.hash);
    }

    #[test]
    fn test_only_first_proposal_prepared() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let first = committee.proposal(2, 1, &[]);
        let second = committee.sign_proposal(Batch::new(
            NodeId(2),
            Round(1),
            vec![],
            vec![TxId::for_payload(b"conflict")],
        ));
        let first_hash = first.message.hash();

        let actions = state.on_proposal(first);
        assert_eq!(broadcast_statements(&actions, MessageKind::Prepare).len(), 1);

        let actions = state.on_proposal(second);
        assert!(broadcast_statements(&actions, MessageKind::Prepare).is_empty());
        assert!(consensus_events(&actions)
            .iter()
            .any(|event| matches!(event, ConsensusEvent::EquivocationDetected { sender, kind: MessageKind::PrePrepare, .. } if *sender == NodeId(2))));
        assert_eq!(
            state
                .log()
                .first_attestation(&Coordinate::new(NodeId(2), Round(1)), MessageKind::Prepare, NodeId(0)),
            Some(first_hash)
        );
    }

    #[test]
    fn test_equivocating_prepare_flagged_and_counted() {
        let committee = Committee::new(4);
        let mut state = committee.state(0);
        let coordinate = Coordinate::new(NodeId(1), Round(1));
        let a = BatchRef::new(coordinate, Hash::from_bytes(b"a"));
        let b = BatchRef::new(coordinate, Hash::from_bytes(b"b"));

        state.on_statement(committee.prepare(3, a));
        let actions = state.on_statement(committee.prepare(3, b));

        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::EquivocationDetected {
                sender: NodeId(3),
                coordinate,
                kind: MessageKind::Prepare,
                first: a.hash,
                second: b.hash,
            }]
        );
        assert!(state.log().is_suspect(NodeId(3)));
        let slot = state.log().slot(&coordinate).unwrap();
        assert_eq!(slot.attesters(MessageKind::Prepare, a.hash), 1);
        assert_eq!(slot.attesters(MessageKind::Prepare, b.hash), 1);
        assert_eq!(state.stats().equivocations, 1);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Ordering
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_first_anchor_commits_at_position_zero() {
        let committee = Committee::new(4);
        let mut state = committee.state(3);

        let actions = deliver(&mut state, &committee.perfect_rounds(2));

        let entries = state.prefix().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].position, 0);
        assert_eq!(entries[0].coordinate, Coordinate::new(NodeId(0), Round(1)));

        assert!(consensus_events(&actions).contains(&ConsensusEvent::Committed {
            position: 0,
            coordinate: entries[0].coordinate,
            hash: entries[0].hash,
        }));
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::EmitCommitted { entries } if entries.len() == 1)));
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::EnqueueInternal {
                event: Event::BatchesCommitted { .. }
            }
        )));
        assert!(state.log().is_committed(&entries[0].coordinate));
    }

    #[test]
    fn test_three_prepares_make_leader_batch_strong_then_first() {
        let committee = Committee::new(4);
        let mut state = committee.state(1);

        let a1 = committee.proposal(0, 1, &[]);
        let a1_ref = a1.batch_ref();
        let mut actions = state.on_proposal(a1);
        for sender in [2, 3] {
            actions.extend(state.on_statement(committee.prepare(sender, a1_ref)));
        }

        assert_eq!(state.log().quorum_status(&a1_ref.coordinate), QuorumStatus::Strong);
        let commits = broadcast_statements(&actions, MessageKind::Commit);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].node_round(), a1_ref.coordinate);
        // Strong prepares alone do not fix a position.
        assert!(state.prefix().is_empty());

        let mut round_one = vec![a1_ref];
        for node in [1, 2] {
            let gossip = committee.proposal(node, 1, &[]);
            round_one.push(gossip.batch_ref());
            state.on_proposal(gossip);
        }
        for batch_ref in &round_one[1..] {
            for sender in [2, 3] {
                state.on_statement(committee.prepare(sender, *batch_ref));
            }
        }
        assert!(state.prefix().is_empty());

        let mut actions = Vec::new();
        for node in [2, 3] {
            let vote = committee.proposal(node, 2, &round_one);
            let vote_ref = vote.batch_ref();
            actions.extend(state.on_proposal(vote));
            for sender in [2, 3] {
                actions.extend(state.on_statement(committee.prepare(sender, vote_ref)));
            }
        }

        let entries = state.prefix().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].position, 0);
        assert_eq!(entries[0].batch_ref(), a1_ref);
        assert!(consensus_events(&actions).contains(&ConsensusEvent::Committed {
            position: 0,
            coordinate: a1_ref.coordinate,
            hash: a1_ref.hash,
        }));
    }

    #[test]
    fn test_second_anchor_commits_history_in_round_node_order() {
        let committee = Committee::new(4);
        let mut state = committee.state(3);
        deliver(&mut state, &committee.perfect_rounds(4));

        let coordinates: Vec<(u64, u64)> = state
            .prefix()
            .entries()
            .iter()
            .map(|entry| (entry.coordinate.node.0, entry.coordinate.round.0))
            .collect();
        assert_eq!(
            coordinates,
            vec![
                (0, 1),
                (1, 1),
                (2, 1),
                (3, 1),
                (0, 2),
                (1, 2),
                (2, 2),
                (3, 2),
                (1, 3),
            ]
        );
    }

    #[test]
    fn test_arrival_order_does_not_change_prefix() {
        let committee = Committee::new(4);
        let events = committee.perfect_rounds(6);

        let mut baseline_state = committee.state(3);
        deliver(&mut baseline_state, &events);
        let baseline = prefix_refs(&baseline_state);
        assert!(baseline.len() >= 9);

        for seed in 0..8 {
            let mut shuffled = events.clone();
            shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
            let mut state = committee.state(3);
            deliver(&mut state, &shuffled);
            assert_eq!(prefix_refs(&state), baseline, "seed {seed}");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════════

    #[traced_test]
    #[test]
    fn test_view_change_releases_missing_anchor() {
        let committee = Committee::new(4);
        let mut state = committee.state(1);
        let mut mempool = MempoolState::new(MempoolConfig::default());

        // Node 0 leads round 1 and never shows up.
        let own = broadcast_proposal(&state.on_proposal_timer(&mut mempool)).unwrap();
        let mut refs = vec![own.batch_ref()];
        for node in [2, 3] {
            let gossip = committee.proposal(node, 1, &[]);
            refs.push(gossip.batch_ref());
            state.on_proposal(gossip);
        }
        for batch_ref in &refs {
            for sender in [2, 3] {
                state.on_statement(committee.prepare(sender, *batch_ref));
            }
        }
        assert_eq!(state.log().strong_at_round(Round(1)).len(), 3);

        state.set_time(Duration::from_secs(1));
        assert!(broadcast_proposal(&state.on_proposal_timer(&mut mempool)).is_none());

        let timeout = state.config().round_timeout;
        state.set_time(Duration::from_secs(1) + timeout);
        let actions = state.try_handle(&Event::ViewChangeTimer).unwrap();
        let requests = broadcast_statements(&actions, MessageKind::ViewChange);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].view(), View(1));
        assert!(consensus_events(&actions).contains(&ConsensusEvent::ViewChangeStarted {
            view: View(0),
            target: View(1)
        }));

        let peer = Message::view_change(Hash::NIL, NodeId(2), Round(1), View(1));
        let actions = state.on_statement(committee.statement(peer));
        assert!(consensus_events(&actions).contains(&ConsensusEvent::ViewChanged {
            from: View(0),
            to: View(1)
        }));
        assert_eq!(state.view(), View(1));

        let proposal = broadcast_proposal(&state.on_proposal_timer(&mut mempool)).unwrap();
        assert_eq!(proposal.batch.round, Round(2));
        assert_eq!(proposal.batch.parents.len(), 3);
        assert!(logs_contain("View changed"));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Cleanup
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_cleanup_prunes_below_history_window() {
        let committee = Committee::new(4);
        let mut state = committee.state_with(3, BftConfig::default().with_gc_depth(2));
        deliver(&mut state, &committee.perfect_rounds(8));
        assert_eq!(state.ordering.last_anchor_round(), Round(7));

        state.try_handle(&Event::CleanupTimer).unwrap();
        assert_eq!(state.log().floor(), Round(5));
        assert_eq!(state.graph().floor(), Round(5));

        let old = committee.proposal(0, 2, &[]).batch_ref();
        let actions = state.on_statement(committee.prepare(1, old));
        assert_eq!(
            consensus_events(&actions),
            vec![ConsensusEvent::MessageRejected {
                sender: NodeId(1),
                reason: RejectReason::Stale
            }]
        );
    }
}

//! Deterministic simulation runner.
//!
//! Each node is an independent committee member with its own keys, mempool
//! and consensus state. The runner delivers broadcasts through the simulated
//! network and records what every node commits.

use crate::event_queue::EventKey;
use crate::network::{Delivery, NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use blockmania_bft::BftConfig;
use blockmania_core::{
    Action, AdmissionOutcome, ConsensusEvent, Event, OutboundMessage, StateMachine, TimerId,
};
use blockmania_mempool::MempoolConfig;
use blockmania_node::NodeStateMachine;
use blockmania_types::{
    CommittedEntry, Crypto, Ed25519Keyring, NodeId, StaticTopology, Topology, TxId,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    /// All nodes in the simulation, indexed by NodeIndex.
    nodes: Vec<NodeStateMachine>,

    /// Per-node signing capability, kept so tests can forge peer messages.
    cryptos: Vec<Arc<dyn Crypto>>,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    /// Network simulator.
    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Timer registry for cancellation support.
    /// Maps (node, timer_id) -> event_key for removal.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    /// Nodes that stopped processing events.
    crashed: BTreeSet<NodeIndex>,

    /// Entries each node emitted as committed, in emission order.
    committed: Vec<Vec<CommittedEntry>>,

    /// Observability events each node emitted.
    consensus_events: Vec<Vec<ConsensusEvent>>,

    /// Admission results each node reported.
    admissions: Vec<Vec<(TxId, AdmissionOutcome)>>,

    /// Statistics.
    stats: SimulationStats,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by type.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Events discarded because their node had crashed.
    pub events_dropped_crash: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
    /// Committed entries emitted across all nodes.
    pub entries_committed: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

impl SimulationRunner {
    /// Create a new simulation runner with default consensus settings.
    pub fn new(network_config: NetworkConfig, seed: u64) -> Self {
        Self::with_bft_config(network_config, seed, BftConfig::default())
    }

    /// Create a new simulation runner with the given consensus settings.
    pub fn with_bft_config(network_config: NetworkConfig, seed: u64, bft_config: BftConfig) -> Self {
        let network = SimulatedNetwork::new(network_config.clone());
        let rng = ChaCha8Rng::seed_from_u64(seed);

        let members: Vec<NodeId> = (0..network_config.num_nodes as u64).map(NodeId).collect();
        let mut nodes = Vec::with_capacity(members.len());
        let mut cryptos = Vec::with_capacity(members.len());

        for (index, id) in members.iter().enumerate() {
            // Key material is derived from the seed so runs are reproducible.
            let crypto = Ed25519Keyring::deterministic(*id, &members, seed).into_arc();
            let topology: Arc<dyn Topology> = match StaticTopology::new(*id, members.clone()) {
                Ok(topology) => topology.into_arc(),
                Err(err) => panic!("invalid simulated committee: {err}"),
            };
            nodes.push(NodeStateMachine::new(
                index as NodeIndex,
                topology,
                Arc::clone(&crypto),
                bft_config.clone(),
                MempoolConfig::default(),
            ));
            cryptos.push(crypto);
        }

        let num_nodes = nodes.len();
        info!(num_nodes, seed, "Created simulation runner");

        Self {
            nodes,
            cryptos,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            rng,
            timers: HashMap::new(),
            crashed: BTreeSet::new(),
            committed: vec![Vec::new(); num_nodes],
            consensus_events: vec![Vec::new(); num_nodes],
            admissions: vec![Vec::new(); num_nodes],
            stats: SimulationStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Get simulation statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Get current simulation time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Number of nodes in the committee.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Get a reference to a node by index.
    pub fn node(&self, index: NodeIndex) -> Option<&NodeStateMachine> {
        self.nodes.get(index as usize)
    }

    /// Signing capability of a node, for forging messages in tests.
    pub fn crypto(&self, index: NodeIndex) -> Option<Arc<dyn Crypto>> {
        self.cryptos.get(index as usize).cloned()
    }

    /// Get a reference to the network.
    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Get a mutable reference to the network for partition/loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Entries a node emitted as committed.
    pub fn committed(&self, index: NodeIndex) -> &[CommittedEntry] {
        self.committed
            .get(index as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Observability events a node emitted.
    pub fn consensus_events(&self, index: NodeIndex) -> &[ConsensusEvent] {
        self.consensus_events
            .get(index as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Admission results a node reported.
    pub fn admissions(&self, index: NodeIndex) -> &[(TxId, AdmissionOutcome)] {
        self.admissions
            .get(index as usize)
            .map_or(&[], Vec::as_slice)
    }

    pub fn is_crashed(&self, index: NodeIndex) -> bool {
        self.crashed.contains(&index)
    }

    /// Whether every pair of non-crashed nodes agrees on their common prefix.
    pub fn prefixes_consistent(&self) -> bool {
        let live: Vec<&[CommittedEntry]> = (0..self.nodes.len() as NodeIndex)
            .filter(|index| !self.is_crashed(*index))
            .map(|index| self.committed(index))
            .collect();
        live.iter().all(|a| {
            live.iter().all(|b| {
                a.iter()
                    .zip(b.iter())
                    .all(|(x, y)| x.position == y.position && x.batch_ref() == y.batch_ref())
            })
        })
    }

    /// Shortest committed prefix among non-crashed nodes.
    pub fn min_committed(&self) -> usize {
        (0..self.nodes.len() as NodeIndex)
            .filter(|index| !self.is_crashed(*index))
            .map(|index| self.committed(index).len())
            .min()
            .unwrap_or(0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scenario control
    // ═══════════════════════════════════════════════════════════════════════

    /// Start every node: arms the recurring timers.
    pub fn initialize(&mut self) {
        for index in 0..self.nodes.len() {
            let actions = self.nodes[index].initialize();
            for action in actions {
                self.process_action(index as NodeIndex, action);
            }
        }
        info!(num_nodes = self.nodes.len(), "Simulation initialized");
    }

    /// Schedule an initial event (e.g., to start the simulation).
    pub fn schedule_initial_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let time = self.now + delay;
        self.schedule_event(node, time, event);
    }

    /// Deliver `event` to `node` at the current time, bypassing the network.
    pub fn inject_event(&mut self, node: NodeIndex, event: Event) {
        self.schedule_event(node, self.now, event);
    }

    /// Submit a client transaction to `node` after `delay`.
    pub fn submit_transaction(&mut self, node: NodeIndex, delay: Duration, payload: Vec<u8>) {
        self.schedule_initial_event(
            node,
            delay,
            Event::SubmitTransaction {
                payload: Arc::new(payload),
            },
        );
    }

    /// Stop a node for good. Its pending events are discarded and it
    /// receives nothing from now on.
    pub fn crash_node(&mut self, node: NodeIndex) {
        if !self.crashed.insert(node) {
            return;
        }
        let before = self.event_queue.len();
        self.event_queue.retain(|key, _| key.node_index != node);
        self.timers.retain(|(owner, _), _| *owner != node);
        warn!(
            node,
            discarded = before - self.event_queue.len(),
            "Node crashed"
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Run simulation until no more events or time limit reached.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );

        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                debug!(
                    remaining_events = self.event_queue.len(),
                    "Time limit reached"
                );
                break;
            }

            // Pop the next event
            let Some((key, event)) = self.event_queue.pop_first() else {
                break;
            };
            self.now = key.time;
            let node_index = key.node_index;

            if self.crashed.contains(&node_index) {
                self.stats.events_dropped_crash += 1;
                continue;
            }

            trace!(
                time = ?self.now,
                node = node_index,
                event = event.type_name(),
                "Processing event"
            );

            // Update stats
            self.stats.events_processed += 1;
            self.stats.events_by_priority[event.priority() as usize] += 1;

            // Update node's time and process event
            let node = &mut self.nodes[node_index as usize];
            node.set_time(self.now);
            let actions = node.handle(event);

            self.stats.actions_generated += actions.len() as u64;

            // Handle actions
            for action in actions {
                self.process_action(node_index, action);
            }
        }

        self.now = self.now.max(end_time);

        trace!(
            events_processed = self.stats.events_processed,
            actions_generated = self.stats.actions_generated,
            final_time = ?self.now,
            "Simulation step complete"
        );
    }

    /// Process an action from a node.
    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in self.network.all_nodes() {
                    if to != from {
                        let event = self.message_to_event(message.clone());
                        self.try_deliver_message(from, to, event);
                    }
                }
            }

            Action::SetTimer { id, duration } => {
                if let Some(previous) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&previous);
                }
                let fire_time = self.now + duration;
                let event = self.timer_to_event(id);
                let key = self.schedule_event(from, fire_time, event);
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }

            Action::EmitCommitted { entries } => {
                self.stats.entries_committed += entries.len() as u64;
                if let Some(log) = self.committed.get_mut(from as usize) {
                    log.extend(entries);
                }
            }

            Action::EmitConsensusEvent { event } => {
                trace!(node = from, event = event.type_name(), "Consensus event");
                if let Some(events) = self.consensus_events.get_mut(from as usize) {
                    events.push(event);
                }
            }

            Action::EmitAdmissionOutcome { tx_id, outcome } => {
                if let Some(admissions) = self.admissions.get_mut(from as usize) {
                    admissions.push((tx_id, outcome));
                }
            }
        }
    }

    /// Schedule an event.
    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Route a message over the simulated link and count the outcome.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, event: Event) {
        match self.network.route(from, to, &mut self.rng) {
            Delivery::After(latency) => {
                self.schedule_event(to, self.now + latency, event);
                self.stats.messages_sent += 1;
            }
            Delivery::Partitioned => {
                self.stats.messages_dropped_partition += 1;
                trace!(from, to, "Message dropped by partition");
            }
            Delivery::Lost => {
                self.stats.messages_dropped_loss += 1;
                trace!(from, to, "Message lost");
            }
        }
    }

    /// Convert an outbound message to an inbound event.
    ///
    /// Sender identity travels inside the signed message, not the event.
    fn message_to_event(&self, message: OutboundMessage) -> Event {
        match message {
            OutboundMessage::Proposal(gossip) => Event::ProposalReceived { gossip },
            OutboundMessage::Statement(gossip) => Event::StatementReceived { gossip },
        }
    }

    /// Convert a timer ID to an event.
    fn timer_to_event(&self, id: TimerId) -> Event {
        match id {
            TimerId::Proposal => Event::ProposalTimer,
            TimerId::ViewChange => Event::ViewChangeTimer,
            TimerId::Cleanup => Event::CleanupTimer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schedules_timers_for_every_node() {
        let mut runner = SimulationRunner::new(NetworkConfig::default(), 1);
        runner.initialize();
        assert_eq!(runner.stats().timers_set, 12);
    }

    #[test]
    fn test_crashed_node_processes_nothing() {
        let mut runner = SimulationRunner::new(NetworkConfig::default(), 1);
        runner.initialize();
        runner.crash_node(2);
        runner.run_until(Duration::from_secs(2));
        assert!(runner.is_crashed(2));
        assert_eq!(runner.node(2).unwrap().bft().own_round().0, 0);
        assert!(runner.committed(2).is_empty());
    }
}

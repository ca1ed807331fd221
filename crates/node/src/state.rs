//! Node state machine.

use blockmania_bft::{BftConfig, BftStats, BlockmaniaState};
use blockmania_core::{Action, Event, StateMachine, SubStateMachine, TimerId};
use blockmania_mempool::{MempoolConfig, MempoolState};
use blockmania_types::{Crypto, NodeId, Topology};
use std::sync::Arc;
use std::time::Duration;

/// Index type for simulation-only node routing.
/// Production identifies peers by the signed `NodeId`.
pub type NodeIndex = u32;

/// Combined node state machine.
///
/// Composes consensus and mempool into a single state machine. The mempool
/// is lent to consensus on every proposal timer; committed batches flow back
/// to the mempool as an internal event.
pub struct NodeStateMachine {
    /// This node's index (simulation-only, for routing).
    node_index: NodeIndex,

    /// Committee membership (single source of truth).
    topology: Arc<dyn Topology>,

    /// Consensus state.
    bft: BlockmaniaState,

    /// Mempool state.
    mempool: MempoolState,

    /// Current time.
    now: Duration,
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("node_index", &self.node_index)
            .field("node", &self.topology.local_node_id())
            .field("bft", &self.bft)
            .field("now", &self.now)
            .finish()
    }
}

impl NodeStateMachine {
    /// Create a new node state machine.
    ///
    /// # Arguments
    ///
    /// * `node_index` - Deterministic node index for routing
    /// * `topology` - Committee membership, including the local node
    /// * `crypto` - Signs for the local node and verifies every member
    /// * `bft_config` - Consensus configuration
    /// * `mempool_config` - Transaction pool limits
    pub fn new(
        node_index: NodeIndex,
        topology: Arc<dyn Topology>,
        crypto: Arc<dyn Crypto>,
        bft_config: BftConfig,
        mempool_config: MempoolConfig,
    ) -> Self {
        Self {
            node_index,
            topology: Arc::clone(&topology),
            bft: BlockmaniaState::new(topology, crypto, bft_config),
            mempool: MempoolState::new(mempool_config),
            now: Duration::ZERO,
        }
    }

    /// Get this node's index.
    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    /// Get this node's committee identity.
    pub fn node_id(&self) -> NodeId {
        self.topology.local_node_id()
    }

    /// Get a reference to the topology.
    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    /// Get a reference to the mempool state.
    pub fn mempool(&self) -> &MempoolState {
        &self.mempool
    }

    /// Get a mutable reference to the mempool state.
    pub fn mempool_mut(&mut self) -> &mut MempoolState {
        &mut self.mempool
    }

    /// Get a reference to the consensus state.
    pub fn bft(&self) -> &BlockmaniaState {
        &self.bft
    }

    pub fn stats(&self) -> BftStats {
        self.bft.stats()
    }

    /// Start the node.
    ///
    /// Returns actions to be processed (the recurring timers).
    pub fn initialize(&mut self) -> Vec<Action> {
        self.bft.initialize()
    }

    /// Handle cleanup timer.
    fn on_cleanup_timer(&mut self, event: &Event) -> Vec<Action> {
        // Consensus reschedules the timer and prunes its own state.
        let actions = self.bft.try_handle(event).unwrap_or_else(|| {
            vec![Action::SetTimer {
                id: TimerId::Cleanup,
                duration: self.bft.config().cleanup_interval,
            }]
        });

        // Offer transactions of batches that never made it into the prefix
        // to a later batch.
        self.mempool.requeue_stale();

        actions
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match &event {
            // ProposalTimer lends the mempool to consensus.
            Event::ProposalTimer => return self.bft.on_proposal_timer(&mut self.mempool),

            Event::CleanupTimer => return self.on_cleanup_timer(&event),

            _ => {}
        }

        // Try consensus first, then the mempool.
        if let Some(actions) = self.bft.try_handle(&event) {
            return actions;
        }
        if let Some(actions) = self.mempool.try_handle(&event) {
            return actions;
        }

        // Event not handled by any sub-machine
        tracing::warn!(event = event.type_name(), "Unhandled event");
        vec![]
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.bft.set_time(now);
        self.mempool.set_time(now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}

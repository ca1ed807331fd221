//! Production runner implementation.

use crate::metrics;
use crate::network::{
    retry_with_backoff, HubTransport, InMemoryHub, NetworkError, RetryError, RetryPolicy, Transport,
};
use crate::timers::TimerManager;
use blockmania_bft::{BftConfig, BftStats};
use blockmania_core::{Action, AdmissionOutcome, ConsensusEvent, Event, StateMachine};
use blockmania_mempool::MempoolConfig;
use blockmania_node::NodeStateMachine;
use blockmania_types::{CommittedEntry, Crypto, NodeId, Topology, TxId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, span, Level};

/// Maximum consensus events handled before lower-priority channels get a turn.
const CONSENSUS_BATCH_SIZE: usize = 10;

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Event channel closed")]
    ChannelClosed,
    #[error("Missing builder field: {0}")]
    MissingField(&'static str),
    #[error("Local node {0} is not a committee member")]
    NotAMember(NodeId),
    #[error("Network error: {0}")]
    NetworkError(#[from] NetworkError),
    #[error("Cancelled before the node attached")]
    Cancelled,
}

/// Everything a runner reports to its embedding application.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Entries appended to the committed prefix, in order.
    Committed(Vec<CommittedEntry>),
    /// Observability event from the engine.
    Consensus(ConsensusEvent),
    /// Result of a client submission.
    Admission { tx_id: TxId, outcome: AdmissionOutcome },
}

/// Handle for shutting down a running ProductionRunner.
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Cloneable handle for submitting client transactions to a runner.
#[derive(Debug, Clone)]
pub struct TransactionSubmitter {
    tx: mpsc::Sender<Event>,
}

impl TransactionSubmitter {
    /// Queue a payload for admission. The outcome is reported as
    /// [`NodeOutput::Admission`].
    pub async fn submit(&self, payload: Vec<u8>) -> Result<(), RunnerError> {
        self.tx
            .send(Event::SubmitTransaction {
                payload: Arc::new(payload),
            })
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }
}

/// Builder for constructing a [`ProductionRunner`].
///
/// Required fields:
/// - `topology` - Committee membership, including the local node
/// - `crypto` - Local signing key plus every member's public key
/// - `hub` - Network the node attaches to
///
/// Optional fields:
/// - `bft_config` - Consensus parameters (defaults to [`BftConfig::default`])
/// - `mempool_config` - Transaction pool limits
/// - `outputs` - Channel receiving [`NodeOutput`]s
/// - `channel_capacity` - Event channel capacity (defaults to 10,000)
/// - `cancellation` - Token that stops attaching and the run loop
pub struct ProductionRunnerBuilder {
    topology: Option<Arc<dyn Topology>>,
    crypto: Option<Arc<dyn Crypto>>,
    bft_config: BftConfig,
    mempool_config: MempoolConfig,
    hub: Option<InMemoryHub>,
    outputs: Option<mpsc::UnboundedSender<NodeOutput>>,
    channel_capacity: usize,
    cancel: Option<CancellationToken>,
}

impl Default for ProductionRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionRunnerBuilder {
    /// Create a new builder with default channel capacity.
    pub fn new() -> Self {
        Self {
            topology: None,
            crypto: None,
            bft_config: BftConfig::default(),
            mempool_config: MempoolConfig::default(),
            hub: None,
            outputs: None,
            channel_capacity: 10_000,
            cancel: None,
        }
    }

    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn crypto(mut self, crypto: Arc<dyn Crypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn bft_config(mut self, config: BftConfig) -> Self {
        self.bft_config = config;
        self
    }

    pub fn mempool_config(mut self, config: MempoolConfig) -> Self {
        self.mempool_config = config;
        self
    }

    /// Attach the node to this hub on build.
    pub fn hub(mut self, hub: InMemoryHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Send committed entries and engine events to `tx`.
    pub fn outputs(mut self, tx: mpsc::UnboundedSender<NodeOutput>) -> Self {
        self.outputs = Some(tx);
        self
    }

    /// Set the event channel capacity (default: 10,000).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Stop attaching and running when `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the production runner, attaching to the hub once.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing, the local node is not
    /// a member, or the node is already attached to the hub.
    pub fn build(self) -> Result<ProductionRunner, RunnerError> {
        let parts = self.prepare()?;
        let transport = parts.hub.join(parts.node_id, parts.consensus_tx.clone())?;
        Ok(parts.finish(transport))
    }

    /// Build the production runner, retrying the hub attachment under
    /// `policy`.
    ///
    /// A restarted node may find its previous incarnation still attached;
    /// the attachment is retried until that one detaches, the policy is
    /// exhausted or the cancellation token fires.
    pub async fn connect(self, policy: &RetryPolicy) -> Result<ProductionRunner, RunnerError> {
        let parts = self.prepare()?;
        let transport = retry_with_backoff(policy, &parts.cancel, |attempt| {
            let joined = parts.hub.join(parts.node_id, parts.consensus_tx.clone());
            if let Err(e) = &joined {
                tracing::debug!(node = %parts.node_id, attempt, error = %e, "Hub attachment failed");
            }
            std::future::ready(joined)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { last, .. } => RunnerError::NetworkError(last),
            RetryError::Cancelled => RunnerError::Cancelled,
        })?;
        Ok(parts.finish(transport))
    }

    fn prepare(self) -> Result<RunnerParts, RunnerError> {
        let topology = self.topology.ok_or(RunnerError::MissingField("topology"))?;
        let crypto = self.crypto.ok_or(RunnerError::MissingField("crypto"))?;
        let hub = self.hub.ok_or(RunnerError::MissingField("hub"))?;

        let node_id = topology.local_node_id();
        let node_index = topology
            .member_index(node_id)
            .ok_or(RunnerError::NotAMember(node_id))?;

        // Separate channels per priority so a flood of client submissions
        // can never delay timers or consensus messages.
        let (timer_tx, timer_rx) = mpsc::channel(16);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (consensus_tx, consensus_rx) = mpsc::channel(self.channel_capacity);
        let (transaction_tx, transaction_rx) = mpsc::channel(self.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let state = NodeStateMachine::new(
            node_index as u32,
            Arc::clone(&topology),
            crypto,
            self.bft_config,
            self.mempool_config,
        );

        Ok(RunnerParts {
            node_id,
            hub,
            state,
            timer_tx,
            timer_rx,
            callback_tx,
            callback_rx,
            consensus_tx,
            consensus_rx,
            transaction_tx,
            transaction_rx,
            shutdown_tx,
            shutdown_rx,
            outputs: self.outputs,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

/// Everything a runner needs except its network attachment.
struct RunnerParts {
    node_id: NodeId,
    hub: InMemoryHub,
    state: NodeStateMachine,
    timer_tx: mpsc::Sender<Event>,
    timer_rx: mpsc::Receiver<Event>,
    callback_tx: mpsc::UnboundedSender<Event>,
    callback_rx: mpsc::UnboundedReceiver<Event>,
    consensus_tx: mpsc::Sender<Event>,
    consensus_rx: mpsc::Receiver<Event>,
    transaction_tx: mpsc::Sender<Event>,
    transaction_rx: mpsc::Receiver<Event>,
    shutdown_tx: oneshot::Sender<()>,
    shutdown_rx: oneshot::Receiver<()>,
    outputs: Option<mpsc::UnboundedSender<NodeOutput>>,
    cancel: CancellationToken,
}

impl RunnerParts {
    fn finish(self, transport: Arc<HubTransport>) -> ProductionRunner {
        ProductionRunner {
            timer_rx: self.timer_rx,
            callback_rx: self.callback_rx,
            callback_tx: self.callback_tx,
            consensus_rx: self.consensus_rx,
            consensus_tx: self.consensus_tx,
            transaction_rx: self.transaction_rx,
            transaction_tx: self.transaction_tx,
            state: self.state,
            start_time: Instant::now(),
            timer_manager: TimerManager::new(self.timer_tx),
            transport,
            outputs: self.outputs,
            shutdown_rx: self.shutdown_rx,
            shutdown_tx: Some(self.shutdown_tx),
            cancel: self.cancel,
        }
    }
}

/// Production runner with async I/O.
///
/// Owns the node state machine and is the only task that touches it. Every
/// input arrives over a channel and every action is executed here.
pub struct ProductionRunner {
    /// Timer events; dedicated so network floods never block them.
    timer_rx: mpsc::Receiver<Event>,
    /// Internal events fed back by the state machine.
    callback_rx: mpsc::UnboundedReceiver<Event>,
    callback_tx: mpsc::UnboundedSender<Event>,
    /// Decoded consensus messages from the transport.
    consensus_rx: mpsc::Receiver<Event>,
    consensus_tx: mpsc::Sender<Event>,
    /// Client submissions.
    transaction_rx: mpsc::Receiver<Event>,
    transaction_tx: mpsc::Sender<Event>,
    /// The state machine (owned, not shared).
    state: NodeStateMachine,
    /// Start time for calculating elapsed duration.
    start_time: Instant,
    timer_manager: TimerManager,
    transport: Arc<dyn Transport>,
    outputs: Option<mpsc::UnboundedSender<NodeOutput>>,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl ProductionRunner {
    /// Create a new builder for constructing a production runner.
    pub fn builder() -> ProductionRunnerBuilder {
        ProductionRunnerBuilder::new()
    }

    pub fn node_id(&self) -> NodeId {
        self.state.node_id()
    }

    pub fn stats(&self) -> BftStats {
        self.state.stats()
    }

    /// Get a sender for injecting consensus events.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.consensus_tx.clone()
    }

    /// Get a handle for client submissions.
    pub fn submitter(&self) -> TransactionSubmitter {
        TransactionSubmitter {
            tx: self.transaction_tx.clone(),
        }
    }

    /// Token that stops the run loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Take the shutdown handle.
    ///
    /// Returns a handle that when dropped triggers graceful shutdown.
    /// Can only be called once; subsequent calls return None.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the event loop until shutdown.
    ///
    /// # Priority Handling
    ///
    /// A `biased` select checks, in order: shutdown, timers, internal
    /// callbacks, consensus messages, client submissions, then the periodic
    /// metrics tick. At most `CONSENSUS_BATCH_SIZE` consensus events are
    /// handled before submissions get a turn.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        tracing::info!(
            node = %self.state.node_id(),
            committee = self.state.topology().committee_size(),
            "Starting production runner"
        );

        self.state.set_time(self.start_time.elapsed());
        for action in self.state.initialize() {
            self.process_action(action)?;
        }

        let mut metrics_tick = tokio::time::interval(Duration::from_secs(1));
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut consensus_batch_count: usize = 0;
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                _ = cancel.cancelled() => {
                    tracing::info!("Cancellation requested");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    let event_span = span!(
                        Level::DEBUG,
                        "handle_timer",
                        event.type = %event.type_name(),
                        node = %self.state.node_id(),
                    );
                    let _event_guard = event_span.enter();
                    self.dispatch_event(event)?;
                }

                Some(event) = self.callback_rx.recv() => {
                    let event_span = span!(
                        Level::DEBUG,
                        "handle_callback",
                        event.type = %event.type_name(),
                        node = %self.state.node_id(),
                    );
                    let _event_guard = event_span.enter();
                    self.dispatch_event(event)?;
                }

                Some(event) = self.consensus_rx.recv(), if consensus_batch_count < CONSENSUS_BATCH_SIZE => {
                    consensus_batch_count += 1;
                    let event_span = span!(
                        Level::DEBUG,
                        "handle_event",
                        event.type = %event.type_name(),
                        node = %self.state.node_id(),
                    );
                    let _event_guard = event_span.enter();
                    self.dispatch_event(event)?;
                }

                Some(event) = self.transaction_rx.recv() => {
                    let event_span = span!(
                        Level::DEBUG,
                        "handle_submission",
                        node = %self.state.node_id(),
                    );
                    let _event_guard = event_span.enter();
                    self.dispatch_event(event)?;
                    consensus_batch_count = 0;
                }

                // Consensus hit its batch limit and no submission was waiting.
                _ = std::future::ready(()), if consensus_batch_count >= CONSENSUS_BATCH_SIZE => {
                    consensus_batch_count = 0;
                }

                _ = metrics_tick.tick() => {
                    let stats = self.state.stats();
                    metrics::set_own_round(stats.own_round);
                    metrics::set_mempool_size(
                        self.state.mempool().pending_count(),
                        self.state.mempool().in_flight_count(),
                    );
                    tracing::debug!(
                        own_round = stats.own_round,
                        view = stats.view,
                        committed = stats.committed,
                        peers = self.transport.peer_count(),
                        "Runner status"
                    );
                }
            }
        }

        self.timer_manager.cancel_all();
        self.transport.stop();
        tracing::info!(node = %self.state.node_id(), "Production runner stopped");
        Ok(())
    }

    /// Feed one event to the state machine and execute what it asks for.
    fn dispatch_event(&mut self, event: Event) -> Result<(), RunnerError> {
        self.state.set_time(self.start_time.elapsed());

        let started = Instant::now();
        let actions = self.state.handle(event);
        metrics::record_event_latency(started.elapsed().as_secs_f64());

        for action in actions {
            self.process_action(action)?;
        }
        Ok(())
    }

    /// Process an action.
    ///
    /// Only a closed internal channel is fatal; network failures are logged
    /// and the message is lost, as it would be on a real link.
    #[instrument(level = "trace", skip(self), fields(action.type = %action.type_name()))]
    fn process_action(&mut self, action: Action) -> Result<(), RunnerError> {
        match action {
            Action::Broadcast { message } => {
                if let Err(e) = self.transport.broadcast(&message) {
                    tracing::warn!(error = %e, message = %message.summary(), "Broadcast failed");
                }
            }

            Action::SetTimer { id, duration } => {
                self.timer_manager.set_timer(id, duration);
            }

            Action::CancelTimer { id } => {
                self.timer_manager.cancel_timer(id);
            }

            Action::EnqueueInternal { event } => {
                self.callback_tx
                    .send(event)
                    .map_err(|_| RunnerError::ChannelClosed)?;
            }

            Action::EmitCommitted { entries } => {
                let transactions = entries
                    .iter()
                    .map(|entry| entry.batch.transactions.len())
                    .sum();
                metrics::record_committed(entries.len(), transactions, self.state.stats().committed);
                tracing::info!(
                    entries = entries.len(),
                    transactions,
                    last_position = entries.last().map(|entry| entry.position),
                    "Prefix extended"
                );
                self.emit(NodeOutput::Committed(entries));
            }

            Action::EmitConsensusEvent { event } => {
                metrics::record_consensus_event(&event);
                self.emit(NodeOutput::Consensus(event));
            }

            Action::EmitAdmissionOutcome { tx_id, outcome } => {
                metrics::record_admission(outcome.as_str());
                self.emit(NodeOutput::Admission { tx_id, outcome });
            }
        }
        Ok(())
    }

    fn emit(&mut self, output: NodeOutput) {
        if let Some(tx) = &self.outputs {
            if tx.send(output).is_err() {
                // Nobody listens any more; stop producing outputs.
                self.outputs = None;
            }
        }
    }
}

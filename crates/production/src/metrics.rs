//! Production metrics using native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use blockmania_core::{ConsensusEvent, RejectReason};
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Consensus ===
    pub entries_committed: Counter,
    pub committed_position: Gauge,
    pub own_round: Gauge,
    pub view: Gauge,
    pub view_changes: Counter,
    pub view_change_requests: Counter,
    pub liveness_degraded: Counter,
    pub equivocations: Counter,

    // === Transactions ===
    pub transactions_committed: Counter,
    pub mempool_pending: Gauge,
    pub mempool_in_flight: Gauge,
    pub admissions: CounterVec,

    // === Infrastructure ===
    pub network_messages_sent: Counter,
    pub network_messages_received: Counter,
    pub network_messages_dropped: Counter,
    pub event_handle_latency: Histogram,

    // === Errors ===
    pub invalid_messages_received: Counter,
    pub messages_rejected: CounterVec,
}

// Registration fails only on a duplicate metric name, which is a programming
// error caught the first time `metrics()` runs.
fn counter(name: &str, help: &str) -> Counter {
    register_counter!(name, help).expect("metric names are unique")
}

fn gauge(name: &str, help: &str) -> Gauge {
    register_gauge!(name, help).expect("metric names are unique")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> CounterVec {
    register_counter_vec!(name, help, labels).expect("metric names are unique")
}

impl Metrics {
    fn new() -> Self {
        Self {
            entries_committed: counter(
                "blockmania_entries_committed_total",
                "Batches appended to the committed prefix",
            ),
            committed_position: gauge(
                "blockmania_committed_position",
                "Length of the committed prefix",
            ),
            own_round: gauge("blockmania_own_round", "Highest round proposed locally"),
            view: gauge("blockmania_view", "Current view number"),
            view_changes: counter(
                "blockmania_view_changes_total",
                "Views adopted after a weak quorum of requests",
            ),
            view_change_requests: counter(
                "blockmania_view_change_requests_total",
                "View-change requests broadcast by this node",
            ),
            liveness_degraded: counter(
                "blockmania_liveness_degraded_total",
                "Times escalation went on without progress",
            ),
            equivocations: counter(
                "blockmania_equivocations_total",
                "Conflicting messages detected from committee members",
            ),

            transactions_committed: counter(
                "blockmania_transactions_committed_total",
                "Transactions contained in committed batches",
            ),
            mempool_pending: gauge(
                "blockmania_mempool_pending",
                "Transactions waiting for a batch",
            ),
            mempool_in_flight: gauge(
                "blockmania_mempool_in_flight",
                "Transactions proposed but not yet committed",
            ),
            admissions: counter_vec(
                "blockmania_admissions_total",
                "Client submissions by outcome",
                &["outcome"],
            ),

            network_messages_sent: counter(
                "blockmania_network_messages_sent_total",
                "Total network messages sent",
            ),
            network_messages_received: counter(
                "blockmania_network_messages_received_total",
                "Total network messages received",
            ),
            network_messages_dropped: counter(
                "blockmania_network_messages_dropped_total",
                "Inbound frames dropped because the receiver was saturated",
            ),
            event_handle_latency: register_histogram!(
                "blockmania_event_handle_latency_seconds",
                "Time spent in the state machine per event",
                vec![0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]
            )
            .expect("metric names are unique"),

            invalid_messages_received: counter(
                "blockmania_invalid_messages_received_total",
                "Frames that failed to decode",
            ),
            messages_rejected: counter_vec(
                "blockmania_messages_rejected_total",
                "Consensus messages dropped by validation",
                &["reason"],
            ),
        }
    }
}

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Record entries appended to the committed prefix.
pub fn record_committed(entries: usize, transactions: usize, prefix_len: u64) {
    let m = metrics();
    m.entries_committed.inc_by(entries as f64);
    m.transactions_committed.inc_by(transactions as f64);
    m.committed_position.set(prefix_len as f64);
}

/// Mirror an engine observability event.
pub fn record_consensus_event(event: &ConsensusEvent) {
    let m = metrics();
    match event {
        ConsensusEvent::EquivocationDetected { .. } => m.equivocations.inc(),
        ConsensusEvent::ViewChangeStarted { .. } => m.view_change_requests.inc(),
        ConsensusEvent::ViewChanged { to, .. } => {
            m.view_changes.inc();
            m.view.set(to.0 as f64);
        }
        ConsensusEvent::LivenessDegraded { .. } => m.liveness_degraded.inc(),
        ConsensusEvent::MessageRejected { reason, .. } => record_message_rejected(*reason),
        // Commits are counted from the committed entries themselves.
        ConsensusEvent::Committed { .. } => {}
    }
}

/// Record a consensus message rejected by validation.
///
/// Labels come from [`RejectReason::as_str`], keeping cardinality fixed.
pub fn record_message_rejected(reason: RejectReason) {
    metrics()
        .messages_rejected
        .with_label_values(&[reason.as_str()])
        .inc();
}

/// Record the outcome of a client submission.
pub fn record_admission(outcome: &str) {
    debug_assert!(
        matches!(outcome, "succeed" | "already_exists" | "rejected"),
        "Unknown admission outcome: {}",
        outcome
    );
    metrics().admissions.with_label_values(&[outcome]).inc();
}

/// Update the local round gauge.
pub fn set_own_round(round: u64) {
    metrics().own_round.set(round as f64);
}

/// Update mempool gauges.
pub fn set_mempool_size(pending: usize, in_flight: usize) {
    let m = metrics();
    m.mempool_pending.set(pending as f64);
    m.mempool_in_flight.set(in_flight as f64);
}

/// Record time spent handling one event.
pub fn record_event_latency(latency_secs: f64) {
    metrics().event_handle_latency.observe(latency_secs);
}

/// Record network message sent.
pub fn record_network_message_sent() {
    metrics().network_messages_sent.inc();
}

/// Record network message received.
pub fn record_network_message_received() {
    metrics().network_messages_received.inc();
}

/// Record an inbound frame dropped at a full inbox.
pub fn record_network_message_dropped() {
    metrics().network_messages_dropped.inc();
}

/// Record a frame that failed to decode.
pub fn record_invalid_message() {
    metrics().invalid_messages_received.inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmania_types::{NodeId, View};

    #[test]
    fn test_consensus_events_update_counters() {
        let before = metrics().view_changes.get();
        record_consensus_event(&ConsensusEvent::ViewChanged {
            from: View(0),
            to: View(3),
        });
        assert!(metrics().view_changes.get() >= before + 1.0);

        let rejected = metrics()
            .messages_rejected
            .with_label_values(&["bad_signature"])
            .get();
        record_consensus_event(&ConsensusEvent::MessageRejected {
            sender: NodeId(9),
            reason: RejectReason::BadSignature,
        });
        assert!(
            metrics()
                .messages_rejected
                .with_label_values(&["bad_signature"])
                .get()
                >= rejected + 1.0
        );
    }

    #[test]
    fn test_committed_counters() {
        record_committed(3, 10, 42);
        assert!(metrics().entries_committed.get() >= 3.0);
        assert!(metrics().transactions_committed.get() >= 10.0);
    }
}

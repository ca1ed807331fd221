//! In-memory mempool state.

use crate::{AdmissionError, Mempool};
use blockmania_core::{Action, Event, SubStateMachine};
use blockmania_types::TxId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Mempool limits.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of held transactions.
    pub max_pending: usize,
    /// Maximum payload size in bytes.
    pub max_tx_bytes: usize,
    /// How long a handed-out transaction may stay uncommitted before it is
    /// offered again.
    pub inflight_timeout: Duration,
    /// How many committed ids are remembered for duplicate detection.
    pub committed_memory: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            max_tx_bytes: 64 * 1024,
            inflight_timeout: Duration::from_secs(30),
            committed_memory: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    InFlight { since: Duration },
}

#[derive(Debug)]
struct PoolEntry {
    payload: Arc<Vec<u8>>,
    status: EntryStatus,
}

/// Content-addressed transaction pool.
///
/// Pending ids are handed out first-in first-out. Each id sits in at most one
/// in-flight batch at a time.
pub struct MempoolState {
    config: MempoolConfig,
    pool: HashMap<TxId, PoolEntry>,
    /// Pending ids in arrival order. May contain ids that have since been
    /// handed out or evicted; those are skipped.
    queue: VecDeque<TxId>,
    committed: HashSet<TxId>,
    committed_order: VecDeque<TxId>,
    now: Duration,
}

impl MempoolState {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            pool: HashMap::new(),
            queue: VecDeque::new(),
            committed: HashSet::new(),
            committed_order: VecDeque::new(),
            now: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Number of transactions waiting to be proposed.
    pub fn pending_count(&self) -> usize {
        self.pool
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .count()
    }

    /// Number of transactions handed out and not yet committed.
    pub fn in_flight_count(&self) -> usize {
        self.pool.len() - self.pending_count()
    }

    /// Handle a client submission.
    #[instrument(skip(self, payload), fields(size = payload.len()))]
    pub fn on_submit_transaction(&mut self, payload: Arc<Vec<u8>>) -> Vec<Action> {
        let (tx_id, outcome) = self.admit(payload);
        tracing::debug!(%tx_id, %outcome, pool_size = self.pool.len(), "Transaction submitted");
        vec![Action::EmitAdmissionOutcome { tx_id, outcome }]
    }

    /// Return long-uncommitted transactions to the pending queue.
    ///
    /// A batch can miss the committed prefix when its round is never
    /// referenced again. Its transactions are offered to a later batch.
    pub fn requeue_stale(&mut self) -> usize {
        let cutoff = self.config.inflight_timeout;
        let now = self.now;
        let mut stale: Vec<TxId> = self
            .pool
            .iter()
            .filter_map(|(id, entry)| match entry.status {
                EntryStatus::InFlight { since } if now.saturating_sub(since) >= cutoff => {
                    Some(*id)
                }
                _ => None,
            })
            .collect();
        stale.sort();

        for id in stale.iter().rev() {
            if let Some(entry) = self.pool.get_mut(id) {
                entry.status = EntryStatus::Pending;
                self.queue.push_front(*id);
            }
        }

        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "Requeued stale in-flight transactions");
        }
        stale.len()
    }

    fn remember_committed(&mut self, id: TxId) {
        if self.committed.insert(id) {
            self.committed_order.push_back(id);
        }
        while self.committed_order.len() > self.config.committed_memory {
            if let Some(old) = self.committed_order.pop_front() {
                self.committed.remove(&old);
            }
        }
    }
}

impl Mempool for MempoolState {
    fn add(&mut self, payload: Arc<Vec<u8>>) -> Result<TxId, AdmissionError> {
        if payload.is_empty() {
            return Err(AdmissionError::Empty);
        }
        if payload.len() > self.config.max_tx_bytes {
            return Err(AdmissionError::TooLarge {
                size: payload.len(),
                max: self.config.max_tx_bytes,
            });
        }

        let id = TxId::for_payload(&payload);
        if self.pool.contains_key(&id) || self.committed.contains(&id) {
            return Err(AdmissionError::AlreadyExists(id));
        }
        if self.pool.len() >= self.config.max_pending {
            return Err(AdmissionError::PoolFull {
                capacity: self.config.max_pending,
            });
        }

        self.pool.insert(
            id,
            PoolEntry {
                payload,
                status: EntryStatus::Pending,
            },
        );
        self.queue.push_back(id);
        Ok(id)
    }

    fn get(&self, id: &TxId) -> Option<Arc<Vec<u8>>> {
        self.pool.get(id).map(|entry| Arc::clone(&entry.payload))
    }

    fn count(&self) -> usize {
        self.pool.len()
    }

    fn next_batch(&mut self, max: usize) -> Vec<TxId> {
        let mut batch = Vec::with_capacity(max.min(self.pool.len()));
        while batch.len() < max {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            if let Some(entry) = self.pool.get_mut(&id) {
                if entry.status == EntryStatus::Pending {
                    entry.status = EntryStatus::InFlight { since: self.now };
                    batch.push(id);
                }
            }
        }
        batch
    }

    fn on_committed(&mut self, ids: &[TxId]) {
        for id in ids {
            self.pool.remove(id);
            self.remember_committed(*id);
        }
    }
}

impl SubStateMachine for MempoolState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::SubmitTransaction { payload } => {
                Some(self.on_submit_transaction(Arc::clone(payload)))
            }
            Event::BatchesCommitted { entries } => {
                let ids: Vec<TxId> = entries
                    .iter()
                    .flat_map(|entry| entry.batch.transactions.iter().copied())
                    .collect();
                self.on_committed(&ids);
                Some(vec![])
            }
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmania_core::AdmissionOutcome;
    use blockmania_types::{Batch, CommittedEntry, Hash, NodeId, Round};
    use tracing_test::traced_test;

    fn payload(bytes: &[u8]) -> Arc<Vec<u8>> {
        Arc::new(bytes.to_vec())
    }

    fn committed(ids: Vec<TxId>) -> Event {
        let batch = Arc::new(Batch::new(NodeId(0), Round(1), vec![], ids));
        Event::BatchesCommitted {
            entries: vec![CommittedEntry {
                position: 0,
                coordinate: batch.coordinate(),
                hash: batch.hash(),
                batch,
            }],
        }
    }

    #[traced_test]
    #[test]
    fn test_submit_reports_outcomes() {
        let mut mempool = MempoolState::new(MempoolConfig::default());

        let actions = mempool.try_handle(&Event::SubmitTransaction {
            payload: payload(b"a"),
        });
        let Some([Action::EmitAdmissionOutcome { tx_id, outcome }]) = actions.as_deref() else {
            panic!("expected one admission outcome, got {actions:?}");
        };
        assert_eq!(*tx_id, TxId::for_payload(b"a"));
        assert_eq!(*outcome, AdmissionOutcome::Succeed);

        let (_, again) = mempool.admit(payload(b"a"));
        assert_eq!(again, AdmissionOutcome::AlreadyExists);

        let (_, empty) = mempool.admit(payload(b""));
        assert_eq!(empty, AdmissionOutcome::Rejected);
    }

    #[test]
    fn test_oversized_and_full_rejected() {
        let mut mempool = MempoolState::new(MempoolConfig {
            max_pending: 1,
            max_tx_bytes: 4,
            ..MempoolConfig::default()
        });
        assert!(matches!(
            mempool.add(payload(b"too long")),
            Err(AdmissionError::TooLarge { size: 8, max: 4 })
        ));
        mempool.add(payload(b"a")).unwrap();
        assert_eq!(
            mempool.add(payload(b"b")),
            Err(AdmissionError::PoolFull { capacity: 1 })
        );
    }

    #[test]
    fn test_next_batch_is_fifo_and_exclusive() {
        let mut mempool = MempoolState::new(MempoolConfig::default());
        let ids: Vec<_> = [b"a", b"b", b"c"]
            .iter()
            .map(|p| mempool.add(payload(*p)).unwrap())
            .collect();

        assert_eq!(mempool.next_batch(2), ids[..2].to_vec());
        assert_eq!(mempool.next_batch(10), ids[2..].to_vec());
        assert!(mempool.next_batch(10).is_empty());
        assert_eq!(mempool.count(), 3);
        assert_eq!(mempool.in_flight_count(), 3);
    }

    #[test]
    fn test_commit_evicts_and_blocks_resubmission() {
        let mut mempool = MempoolState::new(MempoolConfig::default());
        let id = mempool.add(payload(b"a")).unwrap();
        let _ = mempool.next_batch(1);

        mempool.try_handle(&committed(vec![id]));
        assert_eq!(mempool.count(), 0);
        assert!(mempool.get(&id).is_none());
        assert_eq!(mempool.add(payload(b"a")), Err(AdmissionError::AlreadyExists(id)));
    }

    #[test]
    fn test_commit_of_unknown_id_is_harmless() {
        let mut mempool = MempoolState::new(MempoolConfig::default());
        mempool.on_committed(&[TxId(Hash::from_bytes(b"elsewhere"))]);
        assert_eq!(mempool.count(), 0);
    }

    #[test]
    fn test_stale_in_flight_requeued() {
        let mut mempool = MempoolState::new(MempoolConfig {
            inflight_timeout: Duration::from_secs(5),
            ..MempoolConfig::default()
        });
        let id = mempool.add(payload(b"a")).unwrap();
        assert_eq!(mempool.next_batch(1), vec![id]);

        mempool.set_time(Duration::from_secs(4));
        assert_eq!(mempool.requeue_stale(), 0);

        mempool.set_time(Duration::from_secs(5));
        assert_eq!(mempool.requeue_stale(), 1);
        assert_eq!(mempool.next_batch(1), vec![id]);
    }

    #[test]
    fn test_committed_memory_is_bounded() {
        let mut mempool = MempoolState::new(MempoolConfig {
            committed_memory: 1,
            ..MempoolConfig::default()
        });
        let a = TxId::for_payload(b"a");
        let b = TxId::for_payload(b"b");
        mempool.on_committed(&[a, b]);
        assert!(mempool.add(payload(b"a")).is_ok());
        assert_eq!(mempool.add(payload(b"b")), Err(AdmissionError::AlreadyExists(b)));
    }
}

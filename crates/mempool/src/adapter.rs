//! The contract between consensus and a transaction pool.

use blockmania_core::AdmissionOutcome;
use blockmania_types::TxId;
use std::sync::Arc;

/// Why a transaction was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("empty transaction payload")]
    Empty,

    #[error("transaction of {size} bytes exceeds the limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("transaction {0} already known")]
    AlreadyExists(TxId),

    #[error("mempool full ({capacity} pending)")]
    PoolFull { capacity: usize },
}

impl From<&AdmissionError> for AdmissionOutcome {
    fn from(err: &AdmissionError) -> Self {
        match err {
            AdmissionError::AlreadyExists(_) => AdmissionOutcome::AlreadyExists,
            AdmissionError::Empty
            | AdmissionError::TooLarge { .. }
            | AdmissionError::PoolFull { .. } => AdmissionOutcome::Rejected,
        }
    }
}

impl From<AdmissionError> for AdmissionOutcome {
    fn from(err: AdmissionError) -> Self {
        AdmissionOutcome::from(&err)
    }
}

/// A transaction pool as seen by consensus.
pub trait Mempool {
    /// Admit a payload. Its id is the digest of the payload bytes.
    fn add(&mut self, payload: Arc<Vec<u8>>) -> Result<TxId, AdmissionError>;

    /// Payload of a known transaction.
    fn get(&self, id: &TxId) -> Option<Arc<Vec<u8>>>;

    /// Transactions held, pending or in flight.
    fn count(&self) -> usize;

    /// Hand out up to `max` pending ids for a new batch. Handed-out ids are
    /// not returned again until committed or requeued.
    fn next_batch(&mut self, max: usize) -> Vec<TxId>;

    /// Evict transactions that reached the committed prefix.
    fn on_committed(&mut self, ids: &[TxId]);

    /// Admit a payload and report the outcome under its id.
    fn admit(&mut self, payload: Arc<Vec<u8>>) -> (TxId, AdmissionOutcome) {
        let id = TxId::for_payload(&payload);
        let outcome = match self.add(payload) {
            Ok(_) => AdmissionOutcome::Succeed,
            Err(err) => AdmissionOutcome::from(&err),
        };
        (id, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmania_types::Hash;

    #[test]
    fn test_error_to_outcome() {
        let id = TxId(Hash::NIL);
        assert_eq!(
            AdmissionOutcome::from(AdmissionError::AlreadyExists(id)),
            AdmissionOutcome::AlreadyExists
        );
        assert_eq!(
            AdmissionOutcome::from(AdmissionError::Empty),
            AdmissionOutcome::Rejected
        );
        assert_eq!(
            AdmissionOutcome::from(AdmissionError::TooLarge { size: 2, max: 1 }),
            AdmissionOutcome::Rejected
        );
    }
}

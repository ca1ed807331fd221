//! BFT configuration.

use blockmania_types::BatchLimits;
use std::time::Duration;

/// Tunables for the consensus state machine.
///
/// Committee membership is not configured here; it is injected through a
/// [`blockmania_types::Topology`].
#[derive(Debug, Clone)]
pub struct BftConfig {
    /// Interval between proposal attempts.
    pub proposal_interval: Duration,

    /// How long an anchor may stay missing before a view change starts.
    pub round_timeout: Duration,

    /// How long a view change may stay unresolved before escalating.
    pub escalation_timeout: Duration,

    /// Period of the stall check.
    pub view_change_check_interval: Duration,

    /// Maximum accepted distance between the current view and a requested
    /// target view.
    pub max_view_spread: u32,

    /// Escalations without progress before liveness is reported degraded.
    pub degraded_after_escalations: u32,

    /// Maximum transactions per batch.
    pub max_batch_size: usize,

    /// Maximum parents per batch.
    pub max_parents: usize,

    /// Interval between cleanup passes.
    pub cleanup_interval: Duration,

    /// Rounds kept behind the last committed anchor before pruning.
    pub gc_depth: u64,

    /// How far above the local frontier an inbound message may reach.
    pub max_round_lead: u64,
}

impl Default for BftConfig {
    fn default() -> Self {
        let round_timeout = Duration::from_secs(3);
        Self {
            proposal_interval: Duration::from_millis(300),
            round_timeout,
            escalation_timeout: round_timeout * 2,
            view_change_check_interval: Duration::from_millis(250),
            max_view_spread: 8,
            degraded_after_escalations: 4,
            max_batch_size: 512,
            max_parents: 64,
            cleanup_interval: Duration::from_secs(1),
            gc_depth: 64,
            max_round_lead: 64,
        }
    }
}

impl BftConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proposal_interval(mut self, interval: Duration) -> Self {
        self.proposal_interval = interval;
        self
    }

    /// Sets the round timeout. The escalation timeout follows at twice the
    /// value unless set explicitly afterwards.
    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self.escalation_timeout = timeout * 2;
        self
    }

    pub fn with_escalation_timeout(mut self, timeout: Duration) -> Self {
        self.escalation_timeout = timeout;
        self
    }

    pub fn with_view_change_check_interval(mut self, interval: Duration) -> Self {
        self.view_change_check_interval = interval;
        self
    }

    pub fn with_max_view_spread(mut self, spread: u32) -> Self {
        self.max_view_spread = spread;
        self
    }

    pub fn with_degraded_after_escalations(mut self, escalations: u32) -> Self {
        self.degraded_after_escalations = escalations;
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    pub fn with_max_parents(mut self, max: usize) -> Self {
        self.max_parents = max;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_gc_depth(mut self, rounds: u64) -> Self {
        self.gc_depth = rounds;
        self
    }

    pub fn with_max_round_lead(mut self, rounds: u64) -> Self {
        self.max_round_lead = rounds;
        self
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_transactions: self.max_batch_size,
            max_parents: self.max_parents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_follows_round_timeout() {
        let config = BftConfig::new().with_round_timeout(Duration::from_secs(1));
        assert_eq!(config.escalation_timeout, Duration::from_secs(2));

        let config = config.with_escalation_timeout(Duration::from_millis(1500));
        assert_eq!(config.escalation_timeout, Duration::from_millis(1500));
    }
}

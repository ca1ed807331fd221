//! Simulated links between committee members.
//!
//! Every directed link has a latency, the committee default unless
//! overridden, with jitter drawn from the run's RNG. Members can be split
//! into sides: a message crossing sides is dropped until the split heals.
//! Single directed links can also be cut, which is how tests model a member
//! that can send but not hear.

use crate::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::time::Duration;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way latency between two committee members.
    pub latency: Duration,
    /// Jitter as a fraction of the link latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Number of committee members.
    pub num_nodes: u32,
    /// Probability that any single delivery is lost (0.0 - 1.0).
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter_fraction: 0.2,
            num_nodes: 4,
            packet_loss_rate: 0.0,
        }
    }
}

/// Fate of one message on one link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    /// Arrives after the given delay.
    After(Duration),
    /// Sender and receiver are on different sides, or the link is cut.
    Partitioned,
    /// Dropped by random loss.
    Lost,
}

#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Side of each member. Members not listed are on side 0.
    sides: BTreeMap<NodeIndex, u32>,
    next_side: u32,
    /// Directed links that drop everything.
    cut: BTreeSet<(NodeIndex, NodeIndex)>,
    /// Directed links with their own base latency.
    link_latency: BTreeMap<(NodeIndex, NodeIndex), Duration>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            sides: BTreeMap::new(),
            next_side: 1,
            cut: BTreeSet::new(),
            link_latency: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Every committee member.
    pub fn all_nodes(&self) -> Range<NodeIndex> {
        0..self.config.num_nodes
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Splits and cuts
    // ═══════════════════════════════════════════════════════════════════════════

    /// Put each group on its own side. Members in no group stay where they
    /// are.
    pub fn split(&mut self, groups: &[&[NodeIndex]]) {
        for group in groups {
            let side = self.fresh_side();
            for node in *group {
                self.sides.insert(*node, side);
            }
        }
    }

    /// Put `node` on a side of its own.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        self.split(&[&[node]]);
    }

    /// Drop everything sent from `from` to `to`, but not the reverse.
    pub fn cut_link(&mut self, from: NodeIndex, to: NodeIndex) {
        self.cut.insert((from, to));
    }

    /// Rejoin every side and restore every cut link. Latency overrides stay.
    pub fn heal_all(&mut self) {
        self.sides.clear();
        self.cut.clear();
    }

    fn fresh_side(&mut self) -> u32 {
        let side = self.next_side;
        self.next_side += 1;
        side
    }

    fn side(&self, node: NodeIndex) -> u32 {
        self.sides.get(&node).copied().unwrap_or(0)
    }

    /// Whether a message from `from` would be dropped before reaching `to`.
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.side(from) != self.side(to) || self.cut.contains(&(from, to))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Latency and loss
    // ═══════════════════════════════════════════════════════════════════════════

    /// Base latency of the directed link `from -> to`.
    pub fn set_link_latency(&mut self, from: NodeIndex, to: NodeIndex, latency: Duration) {
        self.link_latency.insert((from, to), latency);
    }

    /// Base latency of every link into and out of `node`.
    pub fn set_node_latency(&mut self, node: NodeIndex, latency: Duration) {
        for other in self.all_nodes().filter(|other| *other != node) {
            self.link_latency.insert((node, other), latency);
            self.link_latency.insert((other, node), latency);
        }
    }

    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Base latency of `from -> to` before jitter.
    pub fn link_latency(&self, from: NodeIndex, to: NodeIndex) -> Duration {
        self.link_latency
            .get(&(from, to))
            .copied()
            .unwrap_or(self.config.latency)
    }

    /// Decide what happens to one message on `from -> to`.
    ///
    /// Splits are checked first and never touch the RNG, so healing a split
    /// does not shift the random sequence of the rest of the run.
    pub fn route(&self, from: NodeIndex, to: NodeIndex, rng: &mut ChaCha8Rng) -> Delivery {
        if self.is_partitioned(from, to) {
            return Delivery::Partitioned;
        }
        let loss = self.config.packet_loss_rate;
        if loss > 0.0 && rng.gen::<f64>() < loss {
            return Delivery::Lost;
        }

        let base = self.link_latency(from, to).as_secs_f64();
        let spread = base * self.config.jitter_fraction;
        let jitter = if spread > 0.0 {
            rng.gen_range(-spread..spread)
        } else {
            0.0
        };
        Delivery::After(Duration::from_secs_f64((base + jitter).max(0.001)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn network() -> SimulatedNetwork {
        SimulatedNetwork::new(NetworkConfig::default())
    }

    #[test]
    fn test_same_seed_same_routes() {
        let network = network();
        let mut a = ChaCha8Rng::seed_from_u64(42);
        let mut b = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..50 {
            assert_eq!(network.route(0, 1, &mut a), network.route(0, 1, &mut b));
        }
    }

    #[test]
    fn test_latency_stays_within_jitter() {
        let network = network();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let Delivery::After(delay) = network.route(2, 3, &mut rng) else {
                panic!("lossless link dropped a message");
            };
            assert!(delay >= Duration::from_millis(39) && delay <= Duration::from_millis(61));
        }
    }

    #[test]
    fn test_split_separates_sides_only() {
        let mut network = network();
        network.split(&[&[0, 1], &[2, 3]]);
        assert!(!network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(3, 2));
        assert!(network.is_partitioned(1, 2));
        assert!(network.is_partitioned(2, 1));

        network.heal_all();
        assert!((0..4).all(|a| (0..4).all(|b| !network.is_partitioned(a, b))));
    }

    #[test]
    fn test_isolated_nodes_do_not_share_a_side() {
        let mut network = network();
        network.isolate_node(0);
        network.isolate_node(1);
        assert!(network.is_partitioned(0, 1));
        assert!(network.is_partitioned(0, 2));
        assert!(!network.is_partitioned(2, 3));
    }

    #[test]
    fn test_cut_link_is_directional() {
        let mut network = network();
        network.cut_link(0, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(network.route(0, 3, &mut rng), Delivery::Partitioned);
        assert!(matches!(network.route(3, 0, &mut rng), Delivery::After(_)));
    }

    #[test]
    fn test_slow_node_links() {
        let mut network = SimulatedNetwork::new(NetworkConfig {
            jitter_fraction: 0.0,
            ..Default::default()
        });
        network.set_node_latency(1, Duration::from_millis(400));
        network.set_link_latency(2, 3, Duration::from_millis(5));

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(network.route(1, 0, &mut rng), Delivery::After(Duration::from_millis(400)));
        assert_eq!(network.route(0, 1, &mut rng), Delivery::After(Duration::from_millis(400)));
        assert_eq!(network.route(2, 3, &mut rng), Delivery::After(Duration::from_millis(5)));
        assert_eq!(network.route(3, 2, &mut rng), Delivery::After(Duration::from_millis(50)));

        // Healing splits keeps latency overrides.
        network.heal_all();
        assert_eq!(network.link_latency(1, 2), Duration::from_millis(400));
    }

    #[test]
    fn test_loss_rate_clamped_and_applied() {
        let mut network = network();
        network.set_packet_loss_rate(2.0);
        assert_eq!(network.config().packet_loss_rate, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        assert_eq!(network.route(0, 1, &mut rng), Delivery::Lost);

        network.set_packet_loss_rate(0.0);
        assert!(matches!(network.route(0, 1, &mut rng), Delivery::After(_)));
    }
}

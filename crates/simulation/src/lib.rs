//! Deterministic simulation of a Blockmania committee.
//!
//! Every node runs the real [`NodeStateMachine`](blockmania_node::NodeStateMachine)
//! in a single thread. A global event queue orders timers, message
//! deliveries and internal events by simulated time, and a seeded RNG drives
//! latency, jitter and packet loss. Given the same seed a run is identical
//! every time, so a failing scenario can be replayed exactly.

mod event_queue;
mod network;
mod runner;

pub use blockmania_node::NodeIndex;
pub use event_queue::EventKey;
pub use network::{Delivery, NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};

//! In-process broadcast hub.

use super::codec::{decode_message, encode_message, topic_for};
use super::{NetworkError, Transport};
use crate::metrics;
use blockmania_core::{Event, OutboundMessage};
use blockmania_types::NodeId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

struct Peer {
    consensus_tx: mpsc::Sender<Event>,
    online: bool,
}

/// Shared medium connecting every node of an in-process committee.
///
/// Each node attaches with the sender half of its consensus channel. A node
/// can be taken offline to model a partition: it neither sends nor receives
/// until it is brought back.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    peers: Arc<RwLock<BTreeMap<NodeId, Peer>>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `node` and return its transport handle.
    pub fn join(
        &self,
        node: NodeId,
        consensus_tx: mpsc::Sender<Event>,
    ) -> Result<Arc<HubTransport>, NetworkError> {
        let mut peers = self.peers.write();
        if peers.contains_key(&node) {
            return Err(NetworkError::AlreadyJoined(node.0));
        }
        peers.insert(
            node,
            Peer {
                consensus_tx,
                online: true,
            },
        );
        debug!(%node, peers = peers.len(), "Node joined hub");
        Ok(Arc::new(HubTransport {
            hub: self.clone(),
            local: node,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Detach `node`; frames addressed to it are dropped from now on.
    pub fn leave(&self, node: NodeId) {
        if self.peers.write().remove(&node).is_some() {
            debug!(%node, "Node left hub");
        }
    }

    /// Take a node offline or bring it back.
    pub fn set_online(&self, node: NodeId, online: bool) {
        if let Some(peer) = self.peers.write().get_mut(&node) {
            peer.online = online;
            debug!(%node, online, "Hub connectivity changed");
        }
    }

    pub fn is_online(&self, node: NodeId) -> bool {
        self.peers.read().get(&node).is_some_and(|peer| peer.online)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn publish(&self, from: NodeId, topic: &str, frame: &[u8]) -> Result<usize, NetworkError> {
        let peers = self.peers.read();
        let Some(sender) = peers.get(&from) else {
            return Err(NetworkError::NetworkShutdown);
        };
        if !sender.online {
            trace!(%from, "Sender offline, frame dropped");
            return Ok(0);
        }

        let mut delivered = 0;
        for (node, peer) in peers.iter() {
            if *node == from || !peer.online {
                continue;
            }
            // Every receiver decodes its own copy, as it would off a socket.
            let event = match decode_message(topic, frame) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, topic, "Dropping undecodable frame");
                    metrics::record_invalid_message();
                    continue;
                }
            };
            match peer.consensus_tx.try_send(event) {
                Ok(()) => {
                    delivered += 1;
                    metrics::record_network_message_received();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%node, topic, "Peer inbox full, frame dropped");
                    metrics::record_network_message_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(%node, "Peer inbox closed");
                }
            }
        }
        Ok(delivered)
    }
}

impl std::fmt::Debug for InMemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryHub")
            .field("peers", &self.len())
            .finish()
    }
}

/// A node's handle on an [`InMemoryHub`].
#[derive(Debug)]
pub struct HubTransport {
    hub: InMemoryHub,
    local: NodeId,
    /// Set once this handle detached; a later incarnation of the same node
    /// must not be removed by it.
    stopped: AtomicBool,
}

impl HubTransport {
    pub fn local_node_id(&self) -> NodeId {
        self.local
    }
}

impl Transport for HubTransport {
    fn broadcast(&self, message: &OutboundMessage) -> Result<usize, NetworkError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(NetworkError::NetworkShutdown);
        }
        let frame = encode_message(message)?;
        let delivered = self.hub.publish(self.local, topic_for(message), &frame)?;
        metrics::record_network_message_sent();
        trace!(
            message = %message.summary(),
            bytes = frame.len(),
            delivered,
            "Broadcast frame"
        );
        Ok(delivered)
    }

    fn peer_count(&self) -> usize {
        let peers = self.hub.peers.read();
        peers
            .iter()
            .filter(|(node, peer)| **node != self.local && peer.online)
            .count()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.hub.leave(self.local);
        }
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

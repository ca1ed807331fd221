//! Network layer for production runners.
//!
//! Consensus only ever broadcasts, so the seam is a single [`Transport`]
//! trait. The bundled implementation is an in-process hub used by the devnet
//! binary and the end-to-end tests; frames still go through the wire codec.
//!
//! A transport is started by attaching to the network (see
//! [`InMemoryHub::join`], retried with [`retry_with_backoff`]) and stopped
//! with [`Transport::stop`].

mod codec;
mod hub;
mod retry;

pub use codec::{decode_message, encode_message, topic_for, CodecError, WIRE_VERSION};
pub use hub::{HubTransport, InMemoryHub};
pub use retry::{retry_with_backoff, RetryError, RetryPolicy};

use blockmania_core::OutboundMessage;
use thiserror::Error;

/// Errors from the network layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Node {0} is already attached to the network")]
    AlreadyJoined(u64),

    #[error("Network shutdown")]
    NetworkShutdown,

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),
}

/// Outbound side of the network as seen by a runner.
///
/// Inbound frames are decoded by the transport and delivered straight into
/// the runner's consensus channel.
pub trait Transport: Send + Sync {
    /// Deliver `message` to every other committee member, best effort.
    ///
    /// Returns how many peers the frame was handed to.
    fn broadcast(&self, message: &OutboundMessage) -> Result<usize, NetworkError>;

    /// Number of peers currently reachable.
    fn peer_count(&self) -> usize;

    /// Detach from the network. Inbound delivery stops and later broadcasts
    /// fail with [`NetworkError::NetworkShutdown`]. Idempotent.
    fn stop(&self);
}

//! Core types for Blockmania consensus.
//!
//! This crate provides the foundational types used throughout the engine:
//!
//! - **Primitives**: [`Hash`] digests and the injected [`Crypto`] capability
//! - **Identifiers**: [`NodeId`], [`Round`], [`View`], [`Coordinate`], [`TxId`]
//! - **Protocol data**: [`Message`] and [`Batch`]
//! - **Committee**: the [`Topology`] trait and its quorum arithmetic
//!
//! It does not depend on any other workspace crate.

mod batch;
mod crypto;
mod hash;
mod identifiers;
mod message;
mod signing;
mod topology;

pub use batch::{Batch, BatchError, BatchLimits, CommittedEntry};
pub use crypto::{Crypto, Ed25519Keyring, Signature};
pub use hash::{Hash, HexError};
pub use identifiers::{BatchRef, Coordinate, NodeId, Round, TxId, View};
pub use message::{Message, MessageKind, Statement};
pub use signing::{batch_content_bytes, message_signing_bytes, DOMAIN_BATCH, DOMAIN_MESSAGE};
pub use topology::{StaticTopology, Topology, TopologyError};

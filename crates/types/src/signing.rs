//! Canonical signing payloads.
//!
//! Every signed byte string starts with a domain tag so a signature over one
//! kind of payload can never be replayed as another.

use crate::{Batch, MessageKind, Statement};

/// Domain tag for consensus statements.
pub const DOMAIN_MESSAGE: &[u8] = b"blockmania:msg:";

/// Domain tag for batch content digests.
pub const DOMAIN_BATCH: &[u8] = b"blockmania:batch:";

/// Bytes covered by the signature on a consensus message.
pub fn message_signing_bytes(kind: MessageKind, statement: &Statement) -> Vec<u8> {
    let mut out = Vec::with_capacity(DOMAIN_MESSAGE.len() + 1 + 32 + 8 * 3 + 4);
    out.extend_from_slice(DOMAIN_MESSAGE);
    out.push(kind.tag());
    out.extend_from_slice(statement.hash.as_bytes());
    out.extend_from_slice(&statement.node.0.to_le_bytes());
    out.extend_from_slice(&statement.round.0.to_le_bytes());
    out.extend_from_slice(&statement.sender.0.to_le_bytes());
    out.extend_from_slice(&statement.view.0.to_le_bytes());
    out
}

/// Bytes hashed to produce a batch digest.
pub fn batch_content_bytes(batch: &Batch) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        DOMAIN_BATCH.len() + 32 + batch.parents.len() * 48 + batch.transactions.len() * 32,
    );
    out.extend_from_slice(DOMAIN_BATCH);
    out.extend_from_slice(&batch.node.0.to_le_bytes());
    out.extend_from_slice(&batch.round.0.to_le_bytes());
    out.extend_from_slice(&(batch.parents.len() as u64).to_le_bytes());
    for parent in &batch.parents {
        out.extend_from_slice(&parent.coordinate.node.0.to_le_bytes());
        out.extend_from_slice(&parent.coordinate.round.0.to_le_bytes());
        out.extend_from_slice(parent.hash.as_bytes());
    }
    out.extend_from_slice(&(batch.transactions.len() as u64).to_le_bytes());
    for tx in &batch.transactions {
        out.extend_from_slice(tx.0.as_bytes());
    }
    out
}

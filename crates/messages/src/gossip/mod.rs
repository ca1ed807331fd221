//! Gossip messages broadcast to the whole committee.

mod proposal;
mod statement;

pub use proposal::ProposalGossip;
pub use statement::StatementGossip;

//! Configuration for a lease negotiation node.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Tuning knobs and identity for one node.
///
/// The timing fields interlock: `max_lease_timeout_ms` must leave room for
/// several `round_timeout_ms` windows so renewals can complete before
/// expiry, and `d_max_ms` must genuinely bound the clock skew across the
/// fleet or the validity predicates lose their meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity proposed as lease holder by this node.
    pub identity: NodeId,
    /// Tie-breaker id embedded in this node's ballots. Must be unique
    /// across the fleet.
    pub ballot_owner_id: u64,
    /// How long to wait for a quorum of responses in one phase, in ms.
    pub round_timeout_ms: u64,
    /// Messages older than this are dropped on receipt, in ms.
    pub message_timeout_ms: u64,
    /// Duration of a freshly granted lease, in ms.
    pub max_lease_timeout_ms: u64,
    /// Upper bound on clock skew across all nodes, in ms.
    pub d_max_ms: u64,
    /// Consecutive round failures tolerated before the failure listener is
    /// notified and the retry cadence backs off to the lease timeout.
    pub max_retries: u32,
    /// Whether to fan out LEARN messages to remote acceptors after a
    /// successful round. The local acceptor always learns.
    pub send_learn_messages: bool,
    /// Idle period after which an acceptor garbage-collects cell state,
    /// in ms. The view id survives collection.
    pub cell_timeout_ms: u64,
}

impl Config {
    /// A configuration with conservative defaults for the given identity.
    pub fn new(identity: NodeId, ballot_owner_id: u64) -> Self {
        Self {
            identity,
            ballot_owner_id,
            round_timeout_ms: 500,
            message_timeout_ms: 500,
            max_lease_timeout_ms: 15_000,
            d_max_ms: 500,
            max_retries: 3,
            send_learn_messages: false,
            cell_timeout_ms: 120_000,
        }
    }
}

//! Core types for the lease negotiation protocol.
//!
//! This module defines the building blocks used throughout the crate:
//!
//! - [`ProposalNumber`]: totally ordered ballot identifier for competing proposals
//! - [`CellId`] / [`NodeId`]: opaque names for negotiated resources and nodes
//! - [`MasterEpoch`]: the auxiliary monotonic counter handed to storage layers
//! - [`LeaseError`]: error type for all proposer operations

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, on either the loosely synchronized
/// global clock or the local system clock (context decides which).
pub type Timestamp = u64;

/// Membership-view counter for a cell.
///
/// Used to detect proposers operating with stale knowledge of the acceptor
/// set. [`VIEW_ID_INVALIDATED`] marks a view that must not answer anything.
pub type ViewId = i32;

/// Sentinel view id for a cell whose view has been invalidated.
pub const VIEW_ID_INVALIDATED: ViewId = -1;

/// Ballot identifier for one round of negotiation.
///
/// Total order: compare by `counter`, tie-break by `owner` (the issuing
/// node's ballot-owner id). A proposer's own ballots are strictly increasing
/// over the lifetime of a cell; counters are seeded from the global clock so
/// that a restarted proposer does not reuse old ballots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProposalNumber {
    /// Monotonic round counter, clock-seeded on (re)start.
    pub counter: u64,
    /// Ballot-owner id of the issuing proposer (tie-breaker).
    pub owner: u64,
}

impl ProposalNumber {
    /// The "no proposal" sentinel. Orders below every real proposal.
    pub const NONE: Self = Self {
        counter: 0,
        owner: 0,
    };

    /// Create a new proposal number.
    pub const fn new(counter: u64, owner: u64) -> Self {
        Self { counter, owner }
    }

    /// True if this is the [`ProposalNumber::NONE`] sentinel.
    pub const fn is_none(self) -> bool {
        self.counter == 0
    }

    /// The next ballot of the same owner.
    pub const fn next(self) -> Self {
        Self {
            counter: self.counter + 1,
            owner: self.owner,
        }
    }
}

impl std::fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ballot({}/{})", self.counter, self.owner)
    }
}

/// Identifier of an independently negotiated resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(Arc<str>);

impl CellId {
    /// Create a cell id from any string-ish name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    /// The cell name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity of a node as it appears in lease values (the lease holder).
///
/// Opaque to the protocol; typically a `host:port` style string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Master-epoch field carried by leases and protocol messages.
///
/// The master epoch is a monotonic counter, unrelated to ballots, that a
/// storage layer uses to detect stale primaries after failover. It is only
/// (re)negotiated on a fresh acquire, never on renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterEpoch {
    /// No epoch requested or carried.
    Unrequested,
    /// A prepare asking acceptors to report their stored epoch.
    Requested,
    /// A concrete negotiated or stored epoch value.
    Known(u64),
}

impl MasterEpoch {
    /// The epoch value, if one is known.
    pub fn value(self) -> Option<u64> {
        match self {
            MasterEpoch::Known(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for MasterEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterEpoch::Unrequested => f.write_str("epoch(-)"),
            MasterEpoch::Requested => f.write_str("epoch(?)"),
            MasterEpoch::Known(e) => write!(f, "epoch({e})"),
        }
    }
}

/// Errors raised by proposer operations.
///
/// Preconditions on the public operations fail fast to the caller; mid-round
/// failures are consumed internally by the retry path and only surface to the
/// failure listener as [`LeaseError::RetriesExhausted`] once the retry budget
/// is spent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// The cell has already been opened.
    #[error("cell {0} is already open")]
    AlreadyOpenCell(CellId),

    /// The cell is not open on this proposer.
    #[error("unknown cell {0}")]
    UnknownCell(CellId),

    /// Renew/handover requested by a node that does not hold the lease.
    #[error("not the lease owner (owner is {owner:?})")]
    NotLeaseOwner {
        /// The actual holder, as known locally.
        owner: Option<NodeId>,
    },

    /// Too little time remains before expiry to complete a renewal round.
    #[error("not enough time left to renew: expiry {expires_at} within 2 round timeouts of now {now}")]
    InsufficientTimeForRenewal {
        /// Lease expiry on the global clock.
        expires_at: Timestamp,
        /// Current global time when the renewal was rejected.
        now: Timestamp,
    },

    /// A handover is already in progress for this cell.
    #[error("handover in progress")]
    HandoverInProgress,

    /// No lease information is cached locally (nothing to renew or hand over).
    #[error("no local lease information")]
    NoLocalLeaseInformation,

    /// A round timed out before a majority of valid responses arrived.
    #[error("did not receive enough responses for {phase}")]
    QuorumNotReached {
        /// The phase that timed out ("PREPARE" or "ACCEPT").
        phase: &'static str,
    },

    /// The proposal was overruled by a higher remote ballot.
    #[error("proposal overruled by {by}")]
    Overruled {
        /// The overruling ballot reported in a NACK.
        by: ProposalNumber,
    },

    /// A quorum reported a newer membership view than ours.
    #[error("local view {local} is outdated, quorum reported {seen}")]
    StaleView {
        /// Our view id for the cell.
        local: ViewId,
        /// The maximum view id seen in the responses.
        seen: ViewId,
    },

    /// A response was timestamped implausibly far in the future.
    ///
    /// This indicates clock skew beyond the configured `d_max` bound and is
    /// a standing safety concern, not an ordinary round failure.
    #[error("clock sync drift exceeded: message ts {message_ts} > now {now} + d_max {d_max}")]
    ClockSkewViolation {
        /// The offending send timestamp.
        message_ts: Timestamp,
        /// Current global time at the check.
        now: Timestamp,
        /// The configured skew bound.
        d_max: u64,
    },

    /// The accepted lease sits in the grace period where its validity cannot
    /// be determined under the skew bound; the round is retried after it.
    #[error("accepted lease is in the grace period until {expires_at}")]
    GracePeriod {
        /// Lease expiry on the global clock.
        expires_at: Timestamp,
    },

    /// The consecutive-failure budget is spent; reported to the failure
    /// listener together with the final round error.
    #[error("retries exhausted: {last}")]
    RetriesExhausted {
        /// The error that ended the final attempt.
        last: Box<LeaseError>,
    },
}

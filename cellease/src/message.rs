//! Protocol messages exchanged between proposers and acceptors.
//!
//! A single flat [`Message`] struct carries the union of all fields; the
//! [`MessageKind`] tag says which round step it belongs to. Timer firings
//! re-enter the engine as the `Event*` pseudo-message kinds, which never go
//! on the wire.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::lease::Lease;
use crate::types::{CellId, MasterEpoch, NodeId, ProposalNumber, Timestamp, ViewId};

/// Discriminant for all protocol messages and timer pseudo-messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Phase 1 request from a proposer.
    Prepare,
    /// Positive phase 1 response, possibly carrying a previously accepted
    /// value.
    PrepareAck,
    /// Phase 1 rejection carrying the higher prepared ballot.
    PrepareNack,
    /// Phase 2 request carrying the value to accept.
    Accept,
    /// Positive phase 2 response.
    AcceptAck,
    /// Phase 2 rejection carrying the higher prepared ballot.
    AcceptNack,
    /// Final value broadcast after a successful round.
    Learn,
    /// Rejection of any request carrying an outdated view id.
    WrongView,
    /// Round timeout for an outstanding prepare. Local only.
    EventTimeoutPrepare,
    /// Round timeout for an outstanding accept. Local only.
    EventTimeoutAccept,
    /// Scheduled retry after a cancelled round or lease expiry. Local only.
    EventRestart,
    /// Scheduled lease renewal. Local only.
    EventRenew,
}

impl MessageKind {
    /// Timer pseudo-messages injected by the local event loop.
    pub fn is_internal_event(self) -> bool {
        matches!(
            self,
            MessageKind::EventTimeoutPrepare
                | MessageKind::EventTimeoutAccept
                | MessageKind::EventRestart
                | MessageKind::EventRenew
        )
    }

    /// Requests an acceptor answers.
    pub fn is_acceptor_request(self) -> bool {
        matches!(
            self,
            MessageKind::Prepare | MessageKind::Accept | MessageKind::Learn
        )
    }

    /// Responses (and pseudo-messages) a proposer consumes.
    pub fn is_proposer_input(self) -> bool {
        !self.is_acceptor_request()
    }
}

/// One protocol message.
///
/// All kinds share the same field set; fields irrelevant to a kind hold
/// their neutral value. `send_timestamp` is stamped at send time on the
/// global clock and drives the staleness and skew checks on the receive
/// path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind tag.
    pub kind: MessageKind,
    /// The cell this message belongs to.
    pub cell_id: CellId,
    /// Ballot of the round this message belongs to.
    pub proposal_no: ProposalNumber,
    /// For NACKs, the higher ballot that caused the rejection. For acks,
    /// the previously accepted ballot (if any).
    pub prev_proposal_no: ProposalNumber,
    /// Address of the responding acceptor, `None` for local messages.
    pub sender: Option<SocketAddr>,
    /// Membership view id of the sender for this cell.
    pub view_id: ViewId,
    /// Lease holder carried by this message.
    pub lease_holder: Option<NodeId>,
    /// Lease expiry carried by this message, global clock.
    pub lease_timeout: Timestamp,
    /// Master epoch carried by this message.
    pub master_epoch: MasterEpoch,
    /// Global-clock timestamp set by the sender.
    pub send_timestamp: Timestamp,
}

impl Message {
    /// Create a blank message of the given kind for a cell.
    pub fn new(kind: MessageKind, cell_id: CellId) -> Self {
        Self {
            kind,
            cell_id,
            proposal_no: ProposalNumber::NONE,
            prev_proposal_no: ProposalNumber::NONE,
            sender: None,
            view_id: 0,
            lease_holder: None,
            lease_timeout: 0,
            master_epoch: MasterEpoch::Unrequested,
            send_timestamp: 0,
        }
    }

    /// Create a response of the given kind, inheriting cell id and ballot
    /// from the request.
    pub fn respond(&self, kind: MessageKind) -> Self {
        Self {
            kind,
            cell_id: self.cell_id.clone(),
            proposal_no: self.proposal_no,
            prev_proposal_no: ProposalNumber::NONE,
            sender: None,
            view_id: self.view_id,
            lease_holder: None,
            lease_timeout: 0,
            master_epoch: MasterEpoch::Unrequested,
            send_timestamp: self.send_timestamp,
        }
    }

    /// This message's ballot is strictly newer than `other`'s.
    pub fn after(&self, other: &Message) -> bool {
        self.proposal_no > other.proposal_no
    }

    /// This message's ballot is strictly older than `other`'s.
    pub fn before(&self, other: &Message) -> bool {
        self.proposal_no < other.proposal_no
    }

    /// The carried lease is provably expired under the skew bound.
    pub fn lease_timed_out(&self, now: Timestamp, d_max: u64) -> bool {
        self.lease_timeout + d_max < now
    }

    /// The carried lease is provably still valid under the skew bound.
    pub fn lease_still_valid(&self, now: Timestamp, d_max: u64) -> bool {
        self.lease_timeout > now + d_max
    }

    /// The lease carried by this message as a value.
    pub fn lease(&self) -> Lease {
        Lease {
            holder: self.lease_holder.clone(),
            expires_at: self.lease_timeout,
            master_epoch: self.master_epoch,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}(cell={}, {}, prev={}, holder={:?}, timeout={}, view={}, {})",
            self.kind,
            self.cell_id,
            self.proposal_no,
            self.prev_proposal_no,
            self.lease_holder,
            self.lease_timeout,
            self.view_id,
            self.master_epoch,
        )
    }
}

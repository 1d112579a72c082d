//! Per-cell proposer state.

use std::net::SocketAddr;

use tracing::debug;

use crate::lease::Lease;
use crate::message::Message;
use crate::types::{CellId, NodeId, ProposalNumber, Timestamp, ViewId};

/// Round phase of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No round in flight.
    Idle,
    /// PREPARE broadcast, collecting phase 1 responses.
    AwaitPrepare,
    /// ACCEPT broadcast, collecting phase 2 responses.
    AwaitAccept,
}

/// Mutable state of one negotiated resource, owned by the engine.
///
/// `responses` and `outbound` only live for the duration of one round;
/// both are cleared on every phase transition and on cancellation.
pub struct ProposerCell {
    /// Resource id.
    pub(crate) cell_id: CellId,
    /// Current ballot. Strictly increasing per cell.
    pub(crate) ballot: ProposalNumber,
    /// Remote acceptors for this cell. The local acceptor is implicit.
    pub(crate) acceptors: Vec<SocketAddr>,
    /// Current round phase.
    pub(crate) phase: Phase,
    /// Valid responses accumulated for the in-flight phase.
    pub(crate) responses: Vec<Message>,
    /// The request this cell is currently waiting on.
    pub(crate) outbound: Option<Message>,
    /// Authoritative membership view id.
    pub(crate) view_id: ViewId,
    /// Last lease this proposer learned for the cell.
    pub(crate) prev_lease: Lease,
    /// Consecutive cancelled rounds since the last success.
    pub(crate) failures: u32,
    /// Global time the current negotiation started.
    pub(crate) last_round_started_at: Timestamp,
    /// Pending handover recipient, if any.
    pub(crate) handover_target: Option<NodeId>,
    /// Whether this negotiation (re)establishes the master epoch.
    pub(crate) wants_master_epoch: bool,
    /// Epoch negotiated during PREPARE, carried into ACCEPT and LEARN.
    pub(crate) negotiated_epoch: Option<u64>,
}

impl ProposerCell {
    /// Create the state for a freshly opened cell.
    ///
    /// The initial ballot counter is seeded by the caller from the global
    /// clock so restarted proposers do not reuse old ballots.
    pub fn new(
        cell_id: CellId,
        acceptors: Vec<SocketAddr>,
        initial_counter: u64,
        owner_id: u64,
        request_master_epoch: bool,
    ) -> Self {
        Self {
            cell_id,
            ballot: ProposalNumber::new(initial_counter, owner_id),
            acceptors,
            phase: Phase::Idle,
            responses: Vec::new(),
            outbound: None,
            view_id: 0,
            prev_lease: Lease::empty(),
            failures: 0,
            last_round_started_at: 0,
            handover_target: None,
            wants_master_epoch: request_master_epoch,
            negotiated_epoch: None,
        }
    }

    /// Responses required before a phase may advance: a majority of the
    /// remote acceptors plus the implicit local one.
    pub fn majority_threshold(&self) -> usize {
        (self.acceptors.len() + 1) / 2 + 1
    }

    /// Record a response for the in-flight phase. Duplicate responses from
    /// the same sender are dropped. Returns true if the response counted.
    pub fn record_response(&mut self, msg: Message) -> bool {
        if self.responses.iter().any(|r| r.sender == msg.sender) {
            debug!(cell = %self.cell_id, sender = ?msg.sender, "duplicate response ignored");
            return false;
        }
        self.responses.push(msg);
        true
    }

    /// True once enough responses arrived to evaluate the phase.
    pub fn has_majority(&self) -> bool {
        self.responses.len() >= self.majority_threshold()
    }

    /// Enter a phase with a fresh response buffer and a new outbound
    /// request.
    pub fn begin_phase(&mut self, phase: Phase, outbound: Message) {
        self.phase = phase;
        self.responses.clear();
        self.outbound = Some(outbound);
    }

    /// Drop all round state and return to idle.
    pub fn reset_round(&mut self) {
        self.phase = Phase::Idle;
        self.responses.clear();
        self.outbound = None;
        self.negotiated_epoch = None;
    }
}

//! Proposer engine: drives PREPARE/ACCEPT/LEARN rounds per cell.
//!
//! The engine is logically single-threaded. Every entry point must be
//! called from the same event loop; remote responses and timer firings
//! arrive through [`ProposerEngine::process_message`] as a serialized
//! stream. The co-located acceptor is the one synchronous call in the hot
//! path; its response is fed through the identical response-processing
//! code as remote ones so the quorum logic exists only once.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::cell::{Phase, ProposerCell};
use crate::clock::Clock;
use crate::config::Config;
use crate::lease::Lease;
use crate::message::{Message, MessageKind};
use crate::transport::Communicator;
use crate::types::{
    CellId, LeaseError, MasterEpoch, NodeId, ProposalNumber, Timestamp, ViewId,
    VIEW_ID_INVALIDATED,
};

/// Notifications from the engine to its owner.
pub trait Listeners {
    /// The retry budget for a cell is exhausted; the engine has backed off
    /// to the slowest retry cadence.
    fn lease_failed(&self, cell_id: CellId, error: LeaseError);

    /// A lease value became known for a cell (learned, or served from the
    /// local acceptor's cache).
    fn learned_event(&self, cell_id: CellId, lease: Lease);

    /// A quorum reported a newer membership view than the local one.
    fn view_id_changed(&self, cell_id: CellId, view_id: ViewId);
}

/// Re-entry queue for responses finished asynchronously (master-epoch
/// interposition). Enqueued messages must come back through
/// [`ProposerEngine::process_message`].
pub trait LocalQueue {
    /// Queue a message for processing on the engine's event stream.
    fn enqueue(&self, msg: Message);
}

/// Optional collaborator that durably records master epochs.
///
/// When present, it is interposed between the local acceptor's response
/// and quorum accounting: the handler fills in (or persists) the epoch and
/// then hands the message to `done`, which re-enters the engine via the
/// local queue.
pub trait MasterEpochHandler {
    /// Attach the durably stored epoch to a prepare-ack, then call `done`.
    fn send_master_epoch(&self, msg: Message, done: Box<dyn FnOnce(Message)>);

    /// Persist the epoch carried by an accept-ack, then call `done`.
    fn store_master_epoch(&self, msg: Message, done: Box<dyn FnOnce(Message)>);
}

/// Result of filtering one response against the in-flight request.
enum ResponseCheck {
    Counted,
    Dropped,
    SkewViolation,
}

fn check_response(outbound: &Message, msg: &Message, now: Timestamp, config: &Config) -> ResponseCheck {
    if msg.send_timestamp + config.message_timeout_ms < now {
        debug!(cell = %msg.cell_id, msg = %msg, "ignoring outdated response");
        return ResponseCheck::Dropped;
    }
    if msg.send_timestamp > now + config.d_max_ms {
        return ResponseCheck::SkewViolation;
    }
    if msg.before(outbound) {
        debug!(cell = %msg.cell_id, msg = %msg, "ignoring response older than request");
        return ResponseCheck::Dropped;
    }
    ResponseCheck::Counted
}

/// What a majority evaluation decided.
enum Outcome {
    /// Keep collecting responses.
    Pending,
    /// Round failed; cancel with this reason.
    Cancel(LeaseError),
    /// A newer view id was seen; notify, then cancel.
    ViewOutdated(ViewId),
    /// Phase complete.
    Advance,
}

/// What the LEARN step decided.
enum LearnStep {
    /// The accepted lease is already expired; restart immediately for the
    /// same holder.
    Restart(NodeId),
    /// The lease is valid; distribute it and schedule the follow-up.
    Valid {
        msg: Message,
        renew_at_global: Option<Timestamp>,
        too_late_wait_ms: Option<u64>,
        pending_handover: Option<NodeId>,
    },
    /// Validity is unknown under the skew bound; retry after the grace
    /// period.
    Grace { wait_ms: u64, expires_at: Timestamp },
}

/// The proposer-side protocol engine. Owns all per-cell state.
pub struct ProposerEngine {
    config: Config,
    cells: HashMap<CellId, ProposerCell>,
    local_acceptor: Rc<RefCell<dyn Acceptor>>,
    comm: Rc<dyn Communicator>,
    clock: Rc<dyn Clock>,
    listeners: Rc<dyn Listeners>,
    local_queue: Rc<dyn LocalQueue>,
    epoch_handler: Option<Rc<dyn MasterEpochHandler>>,
}

impl ProposerEngine {
    /// Create an engine around its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        local_acceptor: Rc<RefCell<dyn Acceptor>>,
        comm: Rc<dyn Communicator>,
        clock: Rc<dyn Clock>,
        listeners: Rc<dyn Listeners>,
        local_queue: Rc<dyn LocalQueue>,
        epoch_handler: Option<Rc<dyn MasterEpochHandler>>,
    ) -> Self {
        Self {
            config,
            cells: HashMap::new(),
            local_acceptor,
            comm,
            clock,
            listeners,
            local_queue,
            epoch_handler,
        }
    }

    /// Open a cell and immediately try to acquire its lease.
    pub fn open_cell(
        &mut self,
        cell_id: CellId,
        acceptors: Vec<std::net::SocketAddr>,
        request_master_epoch: bool,
        view_id: ViewId,
    ) -> Result<(), LeaseError> {
        if self.cells.contains_key(&cell_id) {
            return Err(LeaseError::AlreadyOpenCell(cell_id));
        }
        let mut cell = ProposerCell::new(
            cell_id.clone(),
            acceptors,
            self.clock.global_now(),
            self.config.ballot_owner_id,
            request_master_epoch,
        );
        cell.view_id = view_id;
        // The ballot was just clock-seeded; mark the cell fresh so the
        // first round does not reseed it again.
        cell.last_round_started_at = self.clock.local_now();
        info!(cell = %cell_id, view = view_id, "opened cell");
        self.cells.insert(cell_id.clone(), cell);
        self.acquire_lease(&cell_id);
        Ok(())
    }

    /// Close a cell, abandoning any in-flight round.
    pub fn close_cell(&mut self, cell_id: &CellId) {
        if self.cells.remove(cell_id).is_some() {
            info!(cell = %cell_id, "closed cell");
        }
    }

    /// Update the membership view id of an open cell.
    pub fn set_view_id(&mut self, cell_id: &CellId, view_id: ViewId) -> Result<(), LeaseError> {
        let cell = self
            .cells
            .get_mut(cell_id)
            .ok_or_else(|| LeaseError::UnknownCell(cell_id.clone()))?;
        cell.view_id = view_id;
        Ok(())
    }

    /// Replace the cell's previous-lease record. Returns the replaced
    /// lease if it actually changed, `None` otherwise or for unknown
    /// cells.
    pub fn update_prev_lease(&mut self, cell_id: &CellId, lease: Lease) -> Option<Lease> {
        let cell = self.cells.get_mut(cell_id)?;
        if cell.prev_lease != lease {
            let prev = std::mem::replace(&mut cell.prev_lease, lease);
            Some(prev)
        } else {
            None
        }
    }

    /// The cell's current ballot, for timer construction and diagnostics.
    pub fn current_ballot(&self, cell_id: &CellId) -> Option<ProposalNumber> {
        self.cells.get(cell_id).map(|c| c.ballot)
    }

    fn acquire_lease(&mut self, cell_id: &CellId) {
        let now = self.clock.global_now();
        let local_info = self
            .local_acceptor
            .borrow()
            .get_local_lease_information(cell_id);
        if let Some(info) = local_info {
            if info.lease_still_valid(now, self.config.d_max_ms) {
                debug!(cell = %cell_id, "acquire served from local state");
                self.listeners.learned_event(cell_id.clone(), info.lease());
                return;
            }
        }

        let identity = self.config.identity.clone();
        let idle = {
            let Some(cell) = self.cells.get_mut(cell_id) else {
                return;
            };
            if cell.phase == Phase::Idle {
                cell.failures = 0;
                cell.handover_target = None;
                true
            } else {
                debug!(cell = %cell_id, "cell not idle, ignoring acquire");
                false
            }
        };
        if idle {
            self.start_prepare(cell_id, identity);
        }
    }

    /// Renew the lease this node holds for a cell.
    ///
    /// The preconditions fail fast; a renewal that cannot complete two
    /// round trips before expiry (under the skew bound) is rejected so a
    /// doomed round never replaces the running lease timer.
    pub fn renew_lease(&mut self, cell_id: &CellId) -> Result<(), LeaseError> {
        let now = self.clock.global_now();
        {
            let cell = self
                .cells
                .get(cell_id)
                .ok_or_else(|| LeaseError::UnknownCell(cell_id.clone()))?;
            if cell.handover_target.is_some() {
                return Err(LeaseError::HandoverInProgress);
            }
            if cell.phase != Phase::Idle {
                debug!(cell = %cell_id, "round in flight, skipping renew");
                return Ok(());
            }
        }
        let info = self
            .local_acceptor
            .borrow()
            .get_local_lease_information(cell_id)
            .ok_or(LeaseError::NoLocalLeaseInformation)?;
        if info.lease_holder.as_ref() != Some(&self.config.identity) {
            return Err(LeaseError::NotLeaseOwner {
                owner: info.lease_holder,
            });
        }
        if info.lease_timeout < now + 2 * self.config.round_timeout_ms + self.config.d_max_ms {
            return Err(LeaseError::InsufficientTimeForRenewal {
                expires_at: info.lease_timeout,
                now,
            });
        }

        // The epoch is only (re)established on a fresh acquire.
        if let Some(cell) = self.cells.get_mut(cell_id) {
            cell.wants_master_epoch = false;
        }
        let identity = self.config.identity.clone();
        self.start_prepare(cell_id, identity);
        Ok(())
    }

    /// Hand the lease over to another node.
    ///
    /// Same preconditions as renewal. Until the handover round completes,
    /// renewals for the cell are refused.
    pub fn handover_lease(&mut self, cell_id: &CellId, new_owner: NodeId) -> Result<(), LeaseError> {
        let now = self.clock.global_now();
        if !self.cells.contains_key(cell_id) {
            return Err(LeaseError::UnknownCell(cell_id.clone()));
        }
        let info = self
            .local_acceptor
            .borrow()
            .get_local_lease_information(cell_id)
            .ok_or(LeaseError::NoLocalLeaseInformation)?;
        if info.lease_holder.as_ref() != Some(&self.config.identity) {
            return Err(LeaseError::NotLeaseOwner {
                owner: info.lease_holder,
            });
        }
        if info.lease_timeout < now + 2 * self.config.round_timeout_ms + self.config.d_max_ms {
            return Err(LeaseError::InsufficientTimeForRenewal {
                expires_at: info.lease_timeout,
                now,
            });
        }

        let idle = {
            let cell = self.cells.get_mut(cell_id).expect("checked above");
            cell.handover_target = Some(new_owner.clone());
            cell.phase == Phase::Idle
        };
        info!(cell = %cell_id, to = %new_owner, "starting lease handover");
        if idle {
            // The holder is unknown until the handover round settles.
            self.listeners.learned_event(cell_id.clone(), Lease::empty());
            self.start_prepare(cell_id, new_owner);
        }
        Ok(())
    }

    /// Serialized entry point for remote responses and timer events.
    pub fn process_message(&mut self, msg: Message) {
        let Some(cell) = self.cells.get(&msg.cell_id) else {
            debug!(cell = %msg.cell_id, "dropping message for unknown cell");
            return;
        };

        // The view gate applies to remote traffic only; internally
        // injected timers carry no view and are filtered by ballot.
        if !msg.kind.is_internal_event() {
            if cell.view_id == VIEW_ID_INVALIDATED {
                debug!(cell = %msg.cell_id, "dropping message, local view invalidated");
                return;
            }
            if msg.view_id < cell.view_id {
                debug!(
                    cell = %msg.cell_id,
                    local_view = cell.view_id,
                    remote_view = msg.view_id,
                    "dropping message with outdated remote view"
                );
                return;
            }
        }

        match cell.phase {
            Phase::Idle => self.process_idle_event(msg),
            Phase::AwaitPrepare => self.process_prepare_response(msg),
            Phase::AwaitAccept => self.process_accept_response(msg),
        }
    }

    fn process_idle_event(&mut self, msg: Message) {
        let cell_id = msg.cell_id.clone();
        let (ballot, handover) = match self.cells.get(&cell_id) {
            Some(cell) => (cell.ballot, cell.handover_target.clone()),
            None => return,
        };
        match msg.kind {
            MessageKind::EventRestart | MessageKind::EventRenew
                if msg.proposal_no != ballot =>
            {
                // A timer from an older round.
                debug!(
                    cell = %cell_id,
                    timer_ballot = %msg.proposal_no,
                    ballot = %ballot,
                    "dropping stale timer event"
                );
            }
            MessageKind::EventRestart => {
                debug!(cell = %cell_id, ballot = %msg.proposal_no, "restart event");
                let holder = handover.unwrap_or_else(|| self.config.identity.clone());
                self.start_prepare(&cell_id, holder);
            }
            MessageKind::EventRenew => {
                debug!(cell = %cell_id, ballot = %msg.proposal_no, "renew event");
                match self.renew_lease(&cell_id) {
                    Ok(()) => {}
                    Err(LeaseError::HandoverInProgress) => {
                        debug!(cell = %cell_id, "handover in progress, renew skipped");
                    }
                    Err(err) => {
                        warn!(cell = %cell_id, error = %err, "renew failed, resetting cell");
                        let wait_ms = self.config.d_max_ms + self.config.max_lease_timeout_ms;
                        let (timer, fire_at) = {
                            let Some(cell) = self.cells.get_mut(&cell_id) else {
                                return;
                            };
                            cell.reset_round();
                            cell.ballot = cell.ballot.next();
                            cell.failures = 0;
                            let mut timer =
                                Message::new(MessageKind::EventRestart, cell_id.clone());
                            timer.proposal_no = cell.ballot;
                            (timer, self.clock.local_now() + wait_ms)
                        };
                        debug!(cell = %cell_id, wait_ms, "scheduled restart after failed renew");
                        self.comm.request_timer(timer, fire_at);
                    }
                }
            }
            _ => {
                debug!(cell = %cell_id, msg = %msg, "dropping message in idle state");
            }
        }
    }

    fn start_prepare(&mut self, cell_id: &CellId, holder: NodeId) {
        let now = self.clock.global_now();
        let now_local = self.clock.local_now();

        let (msg, acceptors, wants_epoch) = {
            let cell = self.cells.get_mut(cell_id).expect("cell is open");
            assert!(cell.phase == Phase::Idle, "prepare started outside idle");

            if cell.last_round_started_at + self.config.max_lease_timeout_ms < now_local {
                // Long idle: reseed the ballot from the clock, keeping it
                // above every ballot this cell has issued.
                cell.ballot =
                    ProposalNumber::new(now.max(cell.ballot.counter + 1), self.config.ballot_owner_id);
                debug!(cell = %cell_id, ballot = %cell.ballot, "reseeded ballot after idle period");
            }
            cell.last_round_started_at = now_local;

            let mut msg = Message::new(MessageKind::Prepare, cell_id.clone());
            msg.proposal_no = cell.ballot;
            msg.lease_holder = Some(holder);
            msg.lease_timeout = now + self.config.max_lease_timeout_ms;
            msg.send_timestamp = now;
            msg.view_id = cell.view_id;
            if cell.wants_master_epoch {
                msg.master_epoch = MasterEpoch::Requested;
            }
            cell.begin_phase(Phase::AwaitPrepare, msg.clone());
            (msg, cell.acceptors.clone(), cell.wants_master_epoch)
        };

        debug!(cell = %cell_id, ballot = %msg.proposal_no, holder = ?msg.lease_holder,
               "starting PREPARE");
        for addr in &acceptors {
            if let Err(err) = self.comm.send_message(&msg, *addr) {
                // Reduced participation for this round only.
                debug!(cell = %cell_id, error = %err, "prepare send failed");
            }
        }

        let mut timer = Message::new(MessageKind::EventTimeoutPrepare, cell_id.clone());
        timer.proposal_no = msg.proposal_no;
        timer.send_timestamp = now;
        self.comm
            .request_timer(timer, now_local + self.config.round_timeout_ms);

        let response = self.local_acceptor.borrow_mut().handle_prepare(&msg, now);
        self.route_local_response(response, wants_epoch);
    }

    fn process_prepare_response(&mut self, msg: Message) {
        let cell_id = msg.cell_id.clone();
        let now = self.clock.global_now();

        if !matches!(
            msg.kind,
            MessageKind::PrepareAck
                | MessageKind::PrepareNack
                | MessageKind::WrongView
                | MessageKind::EventTimeoutPrepare
        ) {
            debug!(cell = %cell_id, msg = %msg, "ignoring unexpected message type in PREPARE");
            return;
        }

        let outcome = {
            let Some(cell) = self.cells.get_mut(&cell_id) else {
                return;
            };
            assert!(cell.phase == Phase::AwaitPrepare, "response outside PREPARE");
            let outbound = cell.outbound.as_ref().expect("request in flight");

            match check_response(outbound, &msg, now, &self.config) {
                ResponseCheck::Dropped => return,
                ResponseCheck::SkewViolation => {
                    warn!(
                        cell = %cell_id,
                        message_ts = msg.send_timestamp,
                        now,
                        d_max = self.config.d_max_ms,
                        "response timestamp too far in the future, clocks are not in sync"
                    );
                    Outcome::Cancel(LeaseError::ClockSkewViolation {
                        message_ts: msg.send_timestamp,
                        now,
                        d_max: self.config.d_max_ms,
                    })
                }
                ResponseCheck::Counted => {
                    if msg.kind == MessageKind::EventTimeoutPrepare {
                        Outcome::Cancel(LeaseError::QuorumNotReached { phase: "PREPARE" })
                    } else {
                        cell.record_response(msg);
                        if cell.has_majority() {
                            self.evaluate_prepare_quorum(&cell_id, now)
                        } else {
                            Outcome::Pending
                        }
                    }
                }
            }
        };

        self.apply_outcome(&cell_id, outcome, |engine, id| engine.start_accept(id));
    }

    /// Evaluate a complete PREPARE quorum: view check first, then NACK
    /// scan, then adoption of a still-valid previously accepted value,
    /// then master-epoch negotiation.
    fn evaluate_prepare_quorum(&mut self, cell_id: &CellId, now: Timestamp) -> Outcome {
        let d_max = self.config.d_max_ms;
        let identity = self.config.identity.clone();
        let owner_id = self.config.ballot_owner_id;

        let cell = self.cells.get_mut(cell_id).expect("cell is open");
        debug!(
            cell = %cell_id,
            ballot = %cell.ballot,
            responses = cell.responses.len(),
            "majority responded for PREPARE"
        );

        let max_view = cell.responses.iter().map(|r| r.view_id).max().unwrap_or(0);
        if max_view > cell.view_id {
            return Outcome::ViewOutdated(max_view);
        }

        let max_nack_ballot = cell
            .responses
            .iter()
            .filter(|r| r.kind == MessageKind::PrepareNack)
            .map(|r| r.prev_proposal_no)
            .max();
        if let Some(seen) = max_nack_ballot {
            let jump = rand::thread_rng().gen_range(1..=10);
            cell.ballot = ProposalNumber::new(seen.counter + jump, owner_id);
            debug!(cell = %cell_id, overruled_by = %seen, ballot = %cell.ballot,
                   "PREPARE overruled, restarting with jumped ballot");
            return Outcome::Cancel(LeaseError::Overruled { by: seen });
        }

        let prev_accepted = cell
            .responses
            .iter()
            .filter(|r| r.kind == MessageKind::PrepareAck && !r.prev_proposal_no.is_none())
            .max_by_key(|r| r.prev_proposal_no)
            .cloned();
        if let Some(prior) = prev_accepted {
            let outbound = cell.outbound.as_mut().expect("request in flight");
            if prior.lease_still_valid(now, d_max) {
                if prior.lease_holder.as_ref() == Some(&identity) {
                    // Our own still-valid lease: keep the proposed value,
                    // this is a renewal (or a handover away from us).
                    assert!(
                        outbound.lease_holder.as_ref() == Some(&identity)
                            || cell.handover_target.is_some(),
                        "unexpected proposal for a foreign holder"
                    );
                    assert!(
                        outbound.lease_timeout >= prior.lease_timeout,
                        "renewal must not shorten the lease"
                    );
                    debug!(cell = %cell_id, "PREPARE with own proposal (renew)");
                } else {
                    // A still-valid foreign value is in flight; it must
                    // win over our proposal.
                    debug!(cell = %cell_id, holder = ?prior.lease_holder,
                           timeout = prior.lease_timeout, "PREPARE adopts still-valid prior value");
                    outbound.lease_holder = prior.lease_holder.clone();
                    outbound.lease_timeout = prior.lease_timeout;
                }
            } else if prior.lease_timed_out(now, d_max) {
                debug!(cell = %cell_id, "prior accepted lease has timed out, keeping own proposal");
            } else {
                // Grace period: validity cannot be determined, defer to
                // the prior value.
                debug!(cell = %cell_id, holder = ?prior.lease_holder,
                       timeout = prior.lease_timeout, "PREPARE adopts prior value in grace period");
                outbound.lease_holder = prior.lease_holder.clone();
                outbound.lease_timeout = prior.lease_timeout;
            }
        } else {
            debug!(cell = %cell_id, "PREPARE found no prior proposal");
        }

        if cell.wants_master_epoch {
            let max_epoch = cell
                .responses
                .iter()
                .filter(|r| r.kind == MessageKind::PrepareAck)
                .filter_map(|r| r.master_epoch.value())
                .max();
            let max_epoch = max_epoch.expect("no ack carried a master epoch");
            cell.negotiated_epoch = Some(max_epoch + 1);
            debug!(cell = %cell_id, epoch = max_epoch + 1, "negotiated master epoch");
        }

        cell.responses.clear();
        Outcome::Advance
    }

    fn start_accept(&mut self, cell_id: &CellId) {
        let now = self.clock.global_now();
        let now_local = self.clock.local_now();

        let (msg, acceptors, wants_epoch) = {
            let cell = self.cells.get_mut(cell_id).expect("cell is open");
            let prepared = cell.outbound.as_ref().expect("prepare in flight");

            let mut msg = Message::new(MessageKind::Accept, cell_id.clone());
            msg.proposal_no = cell.ballot;
            msg.lease_holder = prepared.lease_holder.clone();
            msg.lease_timeout = prepared.lease_timeout;
            msg.send_timestamp = now;
            msg.view_id = cell.view_id;
            if cell.wants_master_epoch {
                let epoch = cell.negotiated_epoch.expect("epoch negotiated in PREPARE");
                msg.master_epoch = MasterEpoch::Known(epoch);
            }
            cell.begin_phase(Phase::AwaitAccept, msg.clone());
            (msg, cell.acceptors.clone(), cell.wants_master_epoch)
        };

        debug!(cell = %cell_id, ballot = %msg.proposal_no, holder = ?msg.lease_holder,
               "starting ACCEPT");
        for addr in &acceptors {
            if let Err(err) = self.comm.send_message(&msg, *addr) {
                debug!(cell = %cell_id, error = %err, "accept send failed");
            }
        }

        let mut timer = Message::new(MessageKind::EventTimeoutAccept, cell_id.clone());
        timer.proposal_no = msg.proposal_no;
        timer.send_timestamp = now;
        self.comm
            .request_timer(timer, now_local + self.config.round_timeout_ms);

        let response = self.local_acceptor.borrow_mut().handle_accept(&msg, now);
        self.route_local_response(response, wants_epoch);
    }

    fn process_accept_response(&mut self, msg: Message) {
        let cell_id = msg.cell_id.clone();
        let now = self.clock.global_now();

        if !matches!(
            msg.kind,
            MessageKind::AcceptAck
                | MessageKind::AcceptNack
                | MessageKind::WrongView
                | MessageKind::EventTimeoutAccept
        ) {
            debug!(cell = %cell_id, msg = %msg, "ignoring unexpected message type in ACCEPT");
            return;
        }

        let outcome = {
            let Some(cell) = self.cells.get_mut(&cell_id) else {
                return;
            };
            assert!(cell.phase == Phase::AwaitAccept, "response outside ACCEPT");
            let outbound = cell.outbound.as_ref().expect("request in flight");

            match check_response(outbound, &msg, now, &self.config) {
                ResponseCheck::Dropped => return,
                ResponseCheck::SkewViolation => {
                    warn!(
                        cell = %cell_id,
                        message_ts = msg.send_timestamp,
                        now,
                        d_max = self.config.d_max_ms,
                        "response timestamp too far in the future, clocks are not in sync"
                    );
                    Outcome::Cancel(LeaseError::ClockSkewViolation {
                        message_ts: msg.send_timestamp,
                        now,
                        d_max: self.config.d_max_ms,
                    })
                }
                ResponseCheck::Counted => {
                    if msg.kind == MessageKind::EventTimeoutAccept {
                        Outcome::Cancel(LeaseError::QuorumNotReached { phase: "ACCEPT" })
                    } else {
                        cell.record_response(msg);
                        if cell.has_majority() {
                            self.evaluate_accept_quorum(&cell_id)
                        } else {
                            Outcome::Pending
                        }
                    }
                }
            }
        };

        self.apply_outcome(&cell_id, outcome, |engine, id| engine.learn(id));
    }

    fn evaluate_accept_quorum(&mut self, cell_id: &CellId) -> Outcome {
        let owner_id = self.config.ballot_owner_id;
        let cell = self.cells.get_mut(cell_id).expect("cell is open");
        debug!(
            cell = %cell_id,
            ballot = %cell.ballot,
            responses = cell.responses.len(),
            "majority responded for ACCEPT"
        );

        // The view maximum is taken over all responses before the NACK
        // scan, so a response that both raises the view and rejects the
        // ballot is still seen by both checks.
        let max_view = cell.responses.iter().map(|r| r.view_id).max().unwrap_or(0);
        if max_view > cell.view_id {
            return Outcome::ViewOutdated(max_view);
        }

        let max_nack_ballot = cell
            .responses
            .iter()
            .filter(|r| r.kind == MessageKind::AcceptNack)
            .map(|r| r.prev_proposal_no)
            .max();
        if let Some(seen) = max_nack_ballot {
            let jump = rand::thread_rng().gen_range(1..=10);
            cell.ballot = ProposalNumber::new(seen.counter + jump, owner_id);
            debug!(cell = %cell_id, overruled_by = %seen, ballot = %cell.ballot,
                   "ACCEPT overruled, restarting with jumped ballot");
            return Outcome::Cancel(LeaseError::Overruled { by: seen });
        }

        cell.responses.clear();
        Outcome::Advance
    }

    fn apply_outcome(
        &mut self,
        cell_id: &CellId,
        outcome: Outcome,
        advance: impl FnOnce(&mut Self, &CellId),
    ) {
        match outcome {
            Outcome::Pending => {}
            Outcome::Cancel(error) => self.cancel(cell_id, error, 0),
            Outcome::ViewOutdated(seen) => {
                let local = self
                    .cells
                    .get(cell_id)
                    .map(|c| c.view_id)
                    .unwrap_or(VIEW_ID_INVALIDATED);
                debug!(cell = %cell_id, local, seen, "round failed, local view outdated");
                self.listeners.view_id_changed(cell_id.clone(), seen);
                self.cancel(cell_id, LeaseError::StaleView { local, seen }, 0);
            }
            Outcome::Advance => advance(self, cell_id),
        }
    }

    /// Finish a round: return to idle, distribute the chosen value, and
    /// schedule the follow-up dictated by the value's validity.
    fn learn(&mut self, cell_id: &CellId) {
        let now = self.clock.global_now();
        let d_max = self.config.d_max_ms;
        let identity = self.config.identity.clone();

        let step = {
            let cell = self.cells.get_mut(cell_id).expect("cell is open");
            cell.phase = Phase::Idle;
            let accepted = cell.outbound.as_ref().expect("accept in flight");

            let mut msg = Message::new(MessageKind::Learn, cell_id.clone());
            msg.proposal_no = cell.ballot;
            msg.lease_holder = accepted.lease_holder.clone();
            msg.lease_timeout = accepted.lease_timeout;
            msg.send_timestamp = now;
            msg.view_id = cell.view_id;
            if cell.wants_master_epoch {
                let epoch = cell.negotiated_epoch.expect("epoch negotiated in PREPARE");
                msg.master_epoch = MasterEpoch::Known(epoch);
            }
            cell.outbound = Some(msg.clone());

            if msg.lease_timed_out(now, d_max) {
                cell.ballot = cell.ballot.next();
                debug!(cell = %cell_id, "round finished but lease already timed out, restarting");
                LearnStep::Restart(msg.lease_holder.clone().expect("accepted holder"))
            } else if msg.lease_still_valid(now, d_max) {
                cell.ballot = cell.ballot.next();
                cell.failures = 0;
                debug!(cell = %cell_id, holder = ?msg.lease_holder,
                       timeout = msg.lease_timeout, "round finished, lease is valid");

                // A handover is done once its target holds the lease, and
                // void once someone else does. If this node still holds the
                // lease the handover round itself is still outstanding.
                let holder_is_identity = msg.lease_holder.as_ref() == Some(&identity);
                let pending_handover = if cell.handover_target.is_some()
                    && cell.handover_target == msg.lease_holder
                {
                    cell.handover_target = None;
                    None
                } else if holder_is_identity {
                    cell.handover_target.clone()
                } else {
                    cell.handover_target = None;
                    None
                };

                let (renew_at_global, too_late_wait_ms) =
                    if holder_is_identity && pending_handover.is_none() {
                        let renew_at = msg
                            .lease_timeout
                            .saturating_sub(4 * self.config.round_timeout_ms);
                        if now < renew_at {
                            (Some(renew_at), None)
                        } else {
                            let wait = (msg.lease_timeout + d_max).saturating_sub(now);
                            (None, Some(wait))
                        }
                    } else {
                        (None, None)
                    };
                LearnStep::Valid {
                    msg,
                    renew_at_global,
                    too_late_wait_ms,
                    pending_handover,
                }
            } else {
                let wait_ms = (msg.lease_timeout + d_max).saturating_sub(now);
                debug!(cell = %cell_id, wait_ms,
                       "round finished, lease in grace period, restart scheduled");
                LearnStep::Grace {
                    wait_ms,
                    expires_at: msg.lease_timeout,
                }
            }
        };

        match step {
            LearnStep::Restart(holder) => {
                // No externally visible event for an expired value.
                self.start_prepare(cell_id, holder);
            }
            LearnStep::Valid {
                msg,
                renew_at_global,
                too_late_wait_ms,
                pending_handover,
            } => {
                if self.config.send_learn_messages {
                    let acceptors = self
                        .cells
                        .get(cell_id)
                        .map(|c| c.acceptors.clone())
                        .unwrap_or_default();
                    for addr in &acceptors {
                        if let Err(err) = self.comm.send_message(&msg, *addr) {
                            debug!(cell = %cell_id, error = %err, "learn send failed");
                        }
                    }
                }
                // The local acceptor's learn sink reports the new lease to
                // the owner.
                self.local_acceptor.borrow_mut().handle_learn(&msg, now);

                if let Some(target) = pending_handover {
                    info!(cell = %cell_id, to = %target, "resuming deferred lease handover");
                    self.listeners.learned_event(cell_id.clone(), Lease::empty());
                    self.start_prepare(cell_id, target);
                } else if let Some(renew_at) = renew_at_global {
                    let ballot = self
                        .cells
                        .get(cell_id)
                        .map(|c| c.ballot)
                        .expect("cell is open");
                    let mut timer = Message::new(MessageKind::EventRenew, cell_id.clone());
                    timer.proposal_no = ballot;
                    let fire_at = self.clock.global_to_local(renew_at);
                    debug!(cell = %cell_id, renew_at, fire_at, "scheduled lease renewal");
                    self.comm.request_timer(timer, fire_at);
                } else if let Some(wait_ms) = too_late_wait_ms {
                    warn!(cell = %cell_id, wait_ms,
                          "too late to schedule renew, restart after lease times out");
                    self.cancel(
                        cell_id,
                        LeaseError::InsufficientTimeForRenewal {
                            expires_at: msg.lease_timeout,
                            now: self.clock.global_now(),
                        },
                        wait_ms,
                    );
                }
            }
            LearnStep::Grace { wait_ms, expires_at } => {
                self.cancel(cell_id, LeaseError::GracePeriod { expires_at }, wait_ms);
            }
        }
    }

    /// Abort the in-flight round and schedule a retry.
    ///
    /// After `max_retries` consecutive cancellations the failure listener
    /// is notified and the retry backs off to the full lease timeout.
    fn cancel(&mut self, cell_id: &CellId, reason: LeaseError, retry_after_ms: u64) {
        let now = self.clock.global_now();
        let now_local = self.clock.local_now();

        let (timer, fire_at, terminal) = {
            let Some(cell) = self.cells.get_mut(cell_id) else {
                return;
            };
            cell.failures += 1;
            debug!(cell = %cell_id, failures = cell.failures, reason = %reason,
                   "proposal cancelled");
            cell.reset_round();
            cell.ballot = cell.ballot.next();

            let mut timer = Message::new(MessageKind::EventRestart, cell_id.clone());
            timer.proposal_no = cell.ballot;
            timer.send_timestamp = now;

            if cell.failures > self.config.max_retries {
                cell.failures = 0;
                (timer, now_local + self.config.max_lease_timeout_ms, true)
            } else {
                let wait = if retry_after_ms > 0 {
                    retry_after_ms
                } else {
                    // Jitter to desynchronize competing proposers.
                    50 + rand::thread_rng().gen_range(0..100)
                };
                (timer, now_local + wait, false)
            }
        };

        if terminal {
            info!(cell = %cell_id, reason = %reason, "retries exhausted, backing off");
            self.listeners.lease_failed(
                cell_id.clone(),
                LeaseError::RetriesExhausted {
                    last: Box::new(reason),
                },
            );
        }
        self.comm.request_timer(timer, fire_at);
    }

    /// Feed the local acceptor's synchronous response through the same
    /// path as remote ones, interposing the master-epoch handler when the
    /// round negotiates an epoch.
    fn route_local_response(&mut self, mut resp: Message, wants_epoch: bool) {
        resp.sender = None;
        if wants_epoch {
            if let Some(handler) = self.epoch_handler.clone() {
                let queue = self.local_queue.clone();
                match resp.kind {
                    MessageKind::PrepareAck => {
                        handler.send_master_epoch(resp, Box::new(move |m| queue.enqueue(m)));
                        return;
                    }
                    MessageKind::AcceptAck => {
                        handler.store_master_epoch(resp, Box::new(move |m| queue.enqueue(m)));
                        return;
                    }
                    _ => {}
                }
            }
        }
        let phase = match self.cells.get(&resp.cell_id) {
            Some(c) => c.phase,
            None => return,
        };
        match phase {
            Phase::AwaitPrepare => self.process_prepare_response(resp),
            Phase::AwaitAccept => self.process_accept_response(resp),
            Phase::Idle => {
                debug!(cell = %resp.cell_id, "dropping local response in idle state");
            }
        }
    }
}

//! Acceptor role: durable "highest ballot seen" and "last accepted value"
//! bookkeeping per cell.
//!
//! The proposer consumes acceptors through the narrow [`Acceptor`] trait.
//! [`InMemoryAcceptor`] is the crate's own implementation, used both as the
//! co-located local acceptor on every node and as the remote acceptor
//! behind the event loop's message front door.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::config::Config;
use crate::lease::Lease;
use crate::message::{Message, MessageKind};
use crate::types::{CellId, MasterEpoch, Timestamp, ViewId, VIEW_ID_INVALIDATED};

/// The acceptor contract the proposer engine depends on.
///
/// `handle_prepare` and `handle_accept` answer synchronously;
/// `handle_learn` has no response. `get_local_lease_information` serves the
/// acquire fast path with the last learned state, if any.
pub trait Acceptor {
    /// Last learned lease state for a cell, used to short-circuit acquire.
    fn get_local_lease_information(&self, cell_id: &CellId) -> Option<Message>;

    /// Phase 1: record the ballot or reject with the higher prepared one.
    fn handle_prepare(&mut self, msg: &Message, now: Timestamp) -> Message;

    /// Phase 2: record the value or reject with the higher prepared ballot.
    fn handle_accept(&mut self, msg: &Message, now: Timestamp) -> Message;

    /// Record a finally chosen value. No response.
    fn handle_learn(&mut self, msg: &Message, now: Timestamp);
}

/// Callback invoked when the acceptor records a newly learned lease.
pub type LearnSink = Rc<dyn Fn(CellId, Lease)>;

/// Callback invoked when a remote message reveals a newer view id.
pub type ViewObserver = Rc<dyn Fn(CellId, ViewId)>;

/// Per-cell acceptor state.
struct AcceptorCell {
    prepared: Option<Message>,
    accepted: Option<Message>,
    latest_learn: Option<Message>,
    /// Last stored master epoch for this cell.
    master_epoch: u64,
    view_id: ViewId,
    last_access: Timestamp,
}

impl AcceptorCell {
    fn new(now: Timestamp) -> Self {
        Self {
            prepared: None,
            accepted: None,
            latest_learn: None,
            master_epoch: 0,
            view_id: 0,
            last_access: now,
        }
    }

    /// Drop round state after an idle period, keeping the view id.
    fn expire(&mut self, now: Timestamp) {
        self.prepared = None;
        self.accepted = None;
        self.latest_learn = None;
        self.last_access = now;
    }
}

/// In-memory acceptor with per-cell view gating and idle-cell collection.
pub struct InMemoryAcceptor {
    config: Config,
    cells: HashMap<CellId, AcceptorCell>,
    learn_sink: Option<LearnSink>,
    view_observer: Option<ViewObserver>,
}

impl InMemoryAcceptor {
    /// Create an acceptor for this node.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cells: HashMap::new(),
            learn_sink: None,
            view_observer: None,
        }
    }

    /// Register the sink notified on every newly learned lease.
    pub fn set_learn_sink(&mut self, sink: LearnSink) {
        self.learn_sink = Some(sink);
    }

    /// Register the observer notified when a remote view id is newer than
    /// the local one.
    pub fn set_view_observer(&mut self, observer: ViewObserver) {
        self.view_observer = Some(observer);
    }

    /// Set (or invalidate, with [`VIEW_ID_INVALIDATED`]) a cell's view id.
    pub fn set_view_id(&mut self, cell_id: &CellId, view_id: ViewId, now: Timestamp) {
        let cell = self
            .cells
            .entry(cell_id.clone())
            .or_insert_with(|| AcceptorCell::new(now));
        cell.view_id = view_id;
    }

    /// Snapshot of all learned leases, for diagnostics.
    pub fn local_state(&self) -> Vec<(CellId, Lease)> {
        self.cells
            .iter()
            .filter_map(|(id, c)| c.latest_learn.as_ref().map(|m| (id.clone(), m.lease())))
            .collect()
    }

    /// Front door for remote traffic.
    ///
    /// Drops stale messages, applies the per-cell view gate, dispatches by
    /// kind. `None` means nothing is to be sent back.
    pub fn process_message(&mut self, msg: &Message, now: Timestamp) -> Option<Message> {
        if msg.send_timestamp + self.config.message_timeout_ms < now {
            debug!(cell = %msg.cell_id, msg = %msg, "dropping outdated message");
            return None;
        }

        let cell = self.cell_mut(&msg.cell_id, now);
        let local_view = cell.view_id;
        if local_view == VIEW_ID_INVALIDATED || msg.view_id < local_view {
            debug!(
                cell = %msg.cell_id,
                local_view,
                remote_view = msg.view_id,
                "rejecting message with outdated view"
            );
            let mut reject = msg.respond(MessageKind::WrongView);
            reject.view_id = local_view;
            return Some(reject);
        }
        if msg.view_id > local_view {
            if let Some(observer) = self.view_observer.clone() {
                observer(msg.cell_id.clone(), msg.view_id);
            }
        }

        match msg.kind {
            MessageKind::Prepare => Some(self.handle_prepare(msg, now)),
            MessageKind::Accept => Some(self.handle_accept(msg, now)),
            MessageKind::Learn => {
                self.handle_learn(msg, now);
                None
            }
            _ => {
                debug!(cell = %msg.cell_id, kind = ?msg.kind, "ignoring non-request message");
                None
            }
        }
    }

    fn cell_mut(&mut self, cell_id: &CellId, now: Timestamp) -> &mut AcceptorCell {
        let timeout = self.config.cell_timeout_ms;
        let cell = self
            .cells
            .entry(cell_id.clone())
            .or_insert_with(|| AcceptorCell::new(now));
        if cell.last_access + timeout < now {
            debug!(cell = %cell_id, "collecting idle acceptor cell state");
            cell.expire(now);
        }
        cell.last_access = now;
        cell
    }
}

impl Acceptor for InMemoryAcceptor {
    fn get_local_lease_information(&self, cell_id: &CellId) -> Option<Message> {
        self.cells
            .get(cell_id)
            .and_then(|c| c.latest_learn.clone())
    }

    fn handle_prepare(&mut self, msg: &Message, now: Timestamp) -> Message {
        let cell = self.cell_mut(&msg.cell_id, now);

        if let Some(prepared) = &cell.prepared {
            if prepared.after(msg) {
                let mut nack = msg.respond(MessageKind::PrepareNack);
                nack.prev_proposal_no = prepared.proposal_no;
                debug!(cell = %msg.cell_id, ballot = %msg.proposal_no,
                       prepared = %prepared.proposal_no, "prepare rejected");
                return nack;
            }
        }

        cell.prepared = Some(msg.clone());
        let mut ack = msg.respond(MessageKind::PrepareAck);
        if let Some(accepted) = &cell.accepted {
            ack.prev_proposal_no = accepted.proposal_no;
            ack.lease_holder = accepted.lease_holder.clone();
            ack.lease_timeout = accepted.lease_timeout;
        }
        if msg.master_epoch == MasterEpoch::Requested {
            ack.master_epoch = MasterEpoch::Known(cell.master_epoch);
        }
        debug!(cell = %msg.cell_id, ballot = %msg.proposal_no, "prepare acknowledged");
        ack
    }

    fn handle_accept(&mut self, msg: &Message, now: Timestamp) -> Message {
        let cell = self.cell_mut(&msg.cell_id, now);

        if let Some(prepared) = &cell.prepared {
            if prepared.after(msg) {
                let mut nack = msg.respond(MessageKind::AcceptNack);
                nack.prev_proposal_no = prepared.proposal_no;
                debug!(cell = %msg.cell_id, ballot = %msg.proposal_no,
                       prepared = %prepared.proposal_no, "accept rejected");
                return nack;
            }
        }

        if let MasterEpoch::Known(epoch) = msg.master_epoch {
            cell.master_epoch = cell.master_epoch.max(epoch);
        }
        cell.accepted = Some(msg.clone());
        cell.prepared = Some(msg.clone());
        debug!(cell = %msg.cell_id, ballot = %msg.proposal_no, "accept acknowledged");
        let mut ack = msg.respond(MessageKind::AcceptAck);
        // The ack repeats the epoch so an epoch store can be interposed
        // before the ack reaches the proposer.
        ack.master_epoch = msg.master_epoch;
        ack
    }

    fn handle_learn(&mut self, msg: &Message, now: Timestamp) {
        let cell = self.cell_mut(&msg.cell_id, now);

        if let Some(accepted) = &cell.accepted {
            if accepted.after(msg) {
                return;
            }
        }
        if let Some(prepared) = &cell.prepared {
            if prepared.after(msg) {
                return;
            }
        }

        if let MasterEpoch::Known(epoch) = msg.master_epoch {
            cell.master_epoch = cell.master_epoch.max(epoch);
        }
        cell.prepared = Some(msg.clone());
        cell.accepted = Some(msg.clone());
        let is_new = cell
            .latest_learn
            .as_ref()
            .map(|l| msg.after(l))
            .unwrap_or(true);
        if is_new {
            cell.latest_learn = Some(msg.clone());
            debug!(cell = %msg.cell_id, ballot = %msg.proposal_no,
                   holder = ?msg.lease_holder, timeout = msg.lease_timeout, "learned lease");
            if let Some(sink) = self.learn_sink.clone() {
                sink(msg.cell_id.clone(), msg.lease());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::types::{NodeId, ProposalNumber};

    fn test_config() -> Config {
        Config::new(NodeId::from("node-a"), 1)
    }

    fn prepare(cell: &str, ballot: ProposalNumber, ts: Timestamp) -> Message {
        let mut m = Message::new(MessageKind::Prepare, CellId::from(cell));
        m.proposal_no = ballot;
        m.lease_holder = Some(NodeId::from("node-a"));
        m.lease_timeout = ts + 15_000;
        m.send_timestamp = ts;
        m
    }

    fn accept(cell: &str, ballot: ProposalNumber, ts: Timestamp) -> Message {
        let mut m = prepare(cell, ballot, ts);
        m.kind = MessageKind::Accept;
        m
    }

    #[test]
    fn test_prepare_ack_then_nack_on_lower_ballot() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let now = 1_000;

        let high = prepare("c1", ProposalNumber::new(10, 1), now);
        assert_eq!(acc.handle_prepare(&high, now).kind, MessageKind::PrepareAck);

        let low = prepare("c1", ProposalNumber::new(9, 1), now);
        let resp = acc.handle_prepare(&low, now);
        assert_eq!(resp.kind, MessageKind::PrepareNack);
        assert_eq!(resp.prev_proposal_no, ProposalNumber::new(10, 1));
    }

    #[test]
    fn test_prepare_ack_carries_accepted_value() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let now = 1_000;

        let a = accept("c1", ProposalNumber::new(5, 2), now);
        assert_eq!(acc.handle_accept(&a, now).kind, MessageKind::AcceptAck);

        let p = prepare("c1", ProposalNumber::new(6, 1), now);
        let ack = acc.handle_prepare(&p, now);
        assert_eq!(ack.kind, MessageKind::PrepareAck);
        assert_eq!(ack.prev_proposal_no, ProposalNumber::new(5, 2));
        assert_eq!(ack.lease_holder, a.lease_holder);
        assert_eq!(ack.lease_timeout, a.lease_timeout);
    }

    #[test]
    fn test_accept_rejected_after_higher_prepare() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let now = 1_000;

        let p = prepare("c1", ProposalNumber::new(10, 2), now);
        acc.handle_prepare(&p, now);

        let a = accept("c1", ProposalNumber::new(8, 1), now);
        let resp = acc.handle_accept(&a, now);
        assert_eq!(resp.kind, MessageKind::AcceptNack);
        assert_eq!(resp.prev_proposal_no, ProposalNumber::new(10, 2));
    }

    #[test]
    fn test_learn_records_and_notifies_once() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let learned = Rc::new(RefCell::new(Vec::new()));
        let sink = learned.clone();
        acc.set_learn_sink(Rc::new(move |cell, lease| {
            sink.borrow_mut().push((cell, lease));
        }));

        let now = 1_000;
        let mut learn = accept("c1", ProposalNumber::new(5, 1), now);
        learn.kind = MessageKind::Learn;
        acc.handle_learn(&learn, now);
        // Redelivery of the same learn is a no-op.
        acc.handle_learn(&learn, now);

        assert_eq!(learned.borrow().len(), 1);
        let info = acc
            .get_local_lease_information(&CellId::from("c1"))
            .expect("learned state");
        assert_eq!(info.proposal_no, ProposalNumber::new(5, 1));
    }

    #[test]
    fn test_learn_ignored_when_newer_state_exists() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let now = 1_000;

        let p = prepare("c1", ProposalNumber::new(10, 1), now);
        acc.handle_prepare(&p, now);

        let mut stale = accept("c1", ProposalNumber::new(4, 2), now);
        stale.kind = MessageKind::Learn;
        acc.handle_learn(&stale, now);

        assert!(acc.get_local_lease_information(&CellId::from("c1")).is_none());
    }

    #[test]
    fn test_front_door_drops_outdated_message() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let msg = prepare("c1", ProposalNumber::new(1, 1), 1_000);
        // message_timeout_ms default is 500.
        assert!(acc.process_message(&msg, 2_000).is_none());
    }

    #[test]
    fn test_front_door_view_gate() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let now = 1_000;
        acc.set_view_id(&CellId::from("c1"), 5, now);

        let mut old_view = prepare("c1", ProposalNumber::new(1, 1), now);
        old_view.view_id = 3;
        let resp = acc.process_message(&old_view, now).expect("response");
        assert_eq!(resp.kind, MessageKind::WrongView);
        assert_eq!(resp.view_id, 5);

        let observed = Rc::new(RefCell::new(Vec::new()));
        let obs = observed.clone();
        acc.set_view_observer(Rc::new(move |cell, view| {
            obs.borrow_mut().push((cell, view));
        }));
        let mut new_view = prepare("c1", ProposalNumber::new(2, 1), now);
        new_view.view_id = 7;
        let resp = acc.process_message(&new_view, now).expect("response");
        assert_eq!(resp.kind, MessageKind::PrepareAck);
        assert_eq!(observed.borrow().as_slice(), &[(CellId::from("c1"), 7)]);
    }

    #[test]
    fn test_front_door_invalidated_view_answers_wrong_view() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let now = 1_000;
        acc.set_view_id(&CellId::from("c1"), VIEW_ID_INVALIDATED, now);

        let mut msg = prepare("c1", ProposalNumber::new(1, 1), now);
        msg.view_id = 9;
        let resp = acc.process_message(&msg, now).expect("response");
        assert_eq!(resp.kind, MessageKind::WrongView);
        assert_eq!(resp.view_id, VIEW_ID_INVALIDATED);
    }

    #[test]
    fn test_idle_cell_collection_preserves_view() {
        let mut config = test_config();
        config.cell_timeout_ms = 1_000;
        let mut acc = InMemoryAcceptor::new(config);

        let now = 1_000;
        acc.set_view_id(&CellId::from("c1"), 4, now);
        let p = prepare("c1", ProposalNumber::new(10, 1), now);
        acc.handle_prepare(&p, now);

        // Long after the idle window, old round state is gone but the
        // view id still gates.
        let later = now + 10_000;
        let low = prepare("c1", ProposalNumber::new(2, 1), later);
        let resp = acc.handle_prepare(&low, later);
        assert_eq!(resp.kind, MessageKind::PrepareAck);

        let mut gated = prepare("c1", ProposalNumber::new(3, 1), later);
        gated.view_id = 2;
        let resp = acc.process_message(&gated, later).expect("response");
        assert_eq!(resp.kind, MessageKind::WrongView);
        assert_eq!(resp.view_id, 4);
    }

    #[test]
    fn test_prepare_answers_stored_master_epoch_when_requested() {
        let mut acc = InMemoryAcceptor::new(test_config());
        let now = 1_000;

        let mut a = accept("c1", ProposalNumber::new(3, 1), now);
        a.master_epoch = MasterEpoch::Known(7);
        acc.handle_accept(&a, now);

        let mut p = prepare("c1", ProposalNumber::new(4, 1), now);
        p.master_epoch = MasterEpoch::Requested;
        let ack = acc.handle_prepare(&p, now);
        assert_eq!(ack.master_epoch, MasterEpoch::Known(7));

        // Without the request the epoch stays out of the ack.
        let p2 = prepare("c1", ProposalNumber::new(5, 1), now);
        let ack2 = acc.handle_prepare(&p2, now);
        assert_eq!(ack2.master_epoch, MasterEpoch::Unrequested);
    }
}

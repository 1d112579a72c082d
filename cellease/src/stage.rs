//! Event-loop driver wiring a proposer engine and a local acceptor into
//! one single-threaded stage.
//!
//! All protocol work happens inside [`LeaseStage::run`]; the rest of the
//! application talks to it through a cloneable [`StageHandle`] that
//! enqueues commands on an unbounded channel. Remote traffic enters via
//! [`StageHandle::receive_message`] and is routed either to the local
//! acceptor (requests) or to the engine (responses). Timers live in a
//! priority queue keyed by local time; a due timer is stamped with the
//! current global time and re-injected as a pseudo-message.

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::acceptor::{Acceptor, InMemoryAcceptor};
use crate::clock::Clock;
use crate::config::Config;
use crate::lease::Lease;
use crate::message::{Message, MessageKind};
use crate::proposer::{Listeners, LocalQueue, MasterEpochHandler, ProposerEngine};
use crate::transport::{Communicator, MessageSender, SendError};
use crate::types::{CellId, LeaseError, MasterEpoch, NodeId, Timestamp, ViewId};

/// Stage-level notifications to the embedding application.
pub trait StatusListener {
    /// The known lease for a cell changed. An empty lease means the cell
    /// currently has no (known) holder.
    fn status_changed(&self, cell_id: CellId, lease: Lease);

    /// An operation or negotiation for a cell failed.
    fn lease_failed(&self, cell_id: CellId, error: LeaseError);

    /// A quorum reported a newer membership view than the local one.
    fn view_id_changed(&self, cell_id: CellId, view_id: ViewId);
}

enum Command {
    Open {
        cell_id: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: ViewId,
    },
    Close {
        cell_id: CellId,
    },
    SetViewId {
        cell_id: CellId,
        view_id: ViewId,
    },
    Renew {
        cell_id: CellId,
    },
    Handover {
        cell_id: CellId,
        new_owner: NodeId,
    },
    Receive {
        msg: Message,
        from: SocketAddr,
    },
    Inject(Message),
    Learned {
        cell_id: CellId,
        lease: Lease,
    },
    Shutdown,
}

/// Cloneable front end to a running [`LeaseStage`].
///
/// All methods are fire-and-forget; operation failures surface through the
/// [`StatusListener`]. Calls after the stage has shut down are dropped.
#[derive(Clone)]
pub struct StageHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl StageHandle {
    /// Open a cell and start acquiring its lease.
    pub fn open_cell(
        &self,
        cell_id: CellId,
        acceptors: Vec<SocketAddr>,
        request_master_epoch: bool,
        view_id: ViewId,
    ) {
        let _ = self.tx.send(Command::Open {
            cell_id,
            acceptors,
            request_master_epoch,
            view_id,
        });
    }

    /// Close a cell, abandoning any in-flight round.
    pub fn close_cell(&self, cell_id: CellId) {
        let _ = self.tx.send(Command::Close { cell_id });
    }

    /// Update the membership view id for a cell, on the proposer and the
    /// local acceptor both.
    pub fn set_view_id(&self, cell_id: CellId, view_id: ViewId) {
        let _ = self.tx.send(Command::SetViewId { cell_id, view_id });
    }

    /// Renew the lease this node holds for a cell.
    pub fn renew_lease(&self, cell_id: CellId) {
        let _ = self.tx.send(Command::Renew { cell_id });
    }

    /// Hand the lease for a cell over to another node.
    pub fn handover_lease(&self, cell_id: CellId, new_owner: NodeId) {
        let _ = self.tx.send(Command::Handover { cell_id, new_owner });
    }

    /// Deliver a message received from the wire.
    pub fn receive_message(&self, msg: Message, from: SocketAddr) {
        let _ = self.tx.send(Command::Receive { msg, from });
    }

    /// Stop the stage loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

struct TimerEntry {
    fire_at_local: Timestamp,
    seq: u64,
    msg: Message,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_local == other.fire_at_local && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        (other.fire_at_local, other.seq).cmp(&(self.fire_at_local, self.seq))
    }
}

/// One-shot timer queue keyed by local time.
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerQueue {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    fn push(&mut self, msg: Message, fire_at_local: Timestamp) {
        self.seq += 1;
        self.heap.push(TimerEntry {
            fire_at_local,
            seq: self.seq,
            msg,
        });
    }

    fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|e| e.fire_at_local)
    }

    fn pop_due(&mut self, now_local: Timestamp) -> Vec<Message> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.fire_at_local > now_local {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                due.push(entry.msg);
            }
        }
        due
    }
}

/// [`Communicator`] the stage hands to its engine: sends go out through
/// the application's sender, timers into the stage's queue.
struct StageCommunicator {
    sender: Rc<dyn MessageSender>,
    timers: Rc<RefCell<TimerQueue>>,
}

impl Communicator for StageCommunicator {
    fn send_message(&self, msg: &Message, to: SocketAddr) -> Result<(), SendError> {
        self.sender.send(msg, to)
    }

    fn request_timer(&self, msg: Message, fire_at_local: Timestamp) {
        self.timers.borrow_mut().push(msg, fire_at_local);
    }
}

/// Engine listeners backed by the stage. Learn events are deferred through
/// the command queue; failures and view changes go straight out.
struct StageListeners {
    queue: mpsc::UnboundedSender<Command>,
    status: Rc<dyn StatusListener>,
}

impl Listeners for StageListeners {
    fn lease_failed(&self, cell_id: CellId, error: LeaseError) {
        self.status.lease_failed(cell_id, error);
    }

    fn learned_event(&self, cell_id: CellId, lease: Lease) {
        let _ = self.queue.send(Command::Learned { cell_id, lease });
    }

    fn view_id_changed(&self, cell_id: CellId, view_id: ViewId) {
        self.status.view_id_changed(cell_id, view_id);
    }
}

struct StageLocalQueue {
    queue: mpsc::UnboundedSender<Command>,
}

impl LocalQueue for StageLocalQueue {
    fn enqueue(&self, msg: Message) {
        let _ = self.queue.send(Command::Inject(msg));
    }
}

/// The stage itself. Construct with [`LeaseStage::new`], then drive it
/// with [`LeaseStage::run`] on a current-thread runtime.
pub struct LeaseStage {
    config: Config,
    engine: ProposerEngine,
    acceptor: Rc<RefCell<InMemoryAcceptor>>,
    clock: Rc<dyn Clock>,
    sender: Rc<dyn MessageSender>,
    status: Rc<dyn StatusListener>,
    epoch_handler: Option<Rc<dyn MasterEpochHandler>>,
    commands: mpsc::UnboundedReceiver<Command>,
    timers: Rc<RefCell<TimerQueue>>,
    /// Learned, not yet expired leases, for expiry tracking.
    leases: HashMap<CellId, Lease>,
}

impl LeaseStage {
    /// Wire up a stage and return it together with its handle.
    pub fn new(
        config: Config,
        sender: Rc<dyn MessageSender>,
        status: Rc<dyn StatusListener>,
        epoch_handler: Option<Rc<dyn MasterEpochHandler>>,
        clock: Rc<dyn Clock>,
    ) -> (Self, StageHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = Rc::new(RefCell::new(TimerQueue::new()));

        let mut acceptor = InMemoryAcceptor::new(config.clone());
        let learn_queue = tx.clone();
        acceptor.set_learn_sink(Rc::new(move |cell_id, lease| {
            let _ = learn_queue.send(Command::Learned { cell_id, lease });
        }));
        let view_status = status.clone();
        acceptor.set_view_observer(Rc::new(move |cell_id, view_id| {
            view_status.view_id_changed(cell_id, view_id);
        }));
        let acceptor = Rc::new(RefCell::new(acceptor));

        let engine = ProposerEngine::new(
            config.clone(),
            acceptor.clone() as Rc<RefCell<dyn Acceptor>>,
            Rc::new(StageCommunicator {
                sender: sender.clone(),
                timers: timers.clone(),
            }),
            clock.clone(),
            Rc::new(StageListeners {
                queue: tx.clone(),
                status: status.clone(),
            }),
            Rc::new(StageLocalQueue { queue: tx.clone() }),
            epoch_handler.clone(),
        );

        let stage = Self {
            config,
            engine,
            acceptor,
            clock,
            sender,
            status,
            epoch_handler,
            commands: rx,
            timers,
            leases: HashMap::new(),
        };
        (stage, StageHandle { tx })
    }

    /// Drive the stage until [`StageHandle::shutdown`] or until every
    /// handle is dropped.
    pub async fn run(mut self) {
        info!(identity = %self.config.identity, "lease stage running");
        loop {
            let deadline = self.next_deadline();
            let clock = self.clock.clone();
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                _ = Self::sleep_until(deadline, clock), if deadline.is_some() => {
                    self.fire_due();
                }
            }
        }
        info!(identity = %self.config.identity, "lease stage stopped");
    }

    async fn sleep_until(deadline: Option<Timestamp>, clock: Rc<dyn Clock>) {
        if let Some(at) = deadline {
            let wait = at.saturating_sub(clock.local_now());
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    /// Earliest local-time deadline among timers and lease expiries.
    fn next_deadline(&self) -> Option<Timestamp> {
        let timer = self.timers.borrow().next_deadline();
        let expiry = self
            .leases
            .values()
            .map(|l| l.expires_at)
            .min()
            .map(|global| self.clock.global_to_local(global + 1));
        match (timer, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Open {
                cell_id,
                acceptors,
                request_master_epoch,
                view_id,
            } => {
                self.acceptor.borrow_mut().set_view_id(
                    &cell_id,
                    view_id,
                    self.clock.global_now(),
                );
                if let Err(err) =
                    self.engine
                        .open_cell(cell_id.clone(), acceptors, request_master_epoch, view_id)
                {
                    warn!(cell = %cell_id, error = %err, "open failed");
                    self.status.lease_failed(cell_id, err);
                }
            }
            Command::Close { cell_id } => {
                self.leases.remove(&cell_id);
                self.engine.close_cell(&cell_id);
            }
            Command::SetViewId { cell_id, view_id } => {
                self.acceptor.borrow_mut().set_view_id(
                    &cell_id,
                    view_id,
                    self.clock.global_now(),
                );
                if let Err(err) = self.engine.set_view_id(&cell_id, view_id) {
                    warn!(cell = %cell_id, error = %err, "set view failed");
                    self.status.lease_failed(cell_id, err);
                }
            }
            Command::Renew { cell_id } => {
                if let Err(err) = self.engine.renew_lease(&cell_id) {
                    warn!(cell = %cell_id, error = %err, "renew failed");
                    self.status.lease_failed(cell_id, err);
                }
            }
            Command::Handover { cell_id, new_owner } => {
                if let Err(err) = self.engine.handover_lease(&cell_id, new_owner) {
                    warn!(cell = %cell_id, error = %err, "handover failed");
                    self.status.lease_failed(cell_id, err);
                }
            }
            Command::Receive { msg, from } => self.handle_remote(msg, from),
            Command::Inject(msg) => self.engine.process_message(msg),
            Command::Learned { cell_id, lease } => self.handle_learned(cell_id, lease),
            Command::Shutdown => {}
        }
    }

    /// Route one wire message: requests to the local acceptor (answering
    /// back to the origin), responses into the engine.
    fn handle_remote(&mut self, mut msg: Message, from: SocketAddr) {
        let now = self.clock.global_now();
        msg.sender = Some(from);

        if !msg.kind.is_acceptor_request() {
            self.engine.process_message(msg);
            return;
        }

        let Some(mut resp) = self.acceptor.borrow_mut().process_message(&msg, now) else {
            return;
        };

        if let Some(handler) = &self.epoch_handler {
            let answers_epoch_request = resp.kind == MessageKind::PrepareAck
                && msg.master_epoch == MasterEpoch::Requested;
            let carries_epoch = resp.kind == MessageKind::AcceptAck
                && matches!(resp.master_epoch, MasterEpoch::Known(_));
            if answers_epoch_request || carries_epoch {
                let sender = self.sender.clone();
                let clock = self.clock.clone();
                let done = Box::new(move |mut m: Message| {
                    m.send_timestamp = clock.global_now();
                    if let Err(err) = sender.send(&m, from) {
                        debug!(error = %err, "response send failed");
                    }
                });
                if answers_epoch_request {
                    handler.send_master_epoch(resp, done);
                } else {
                    handler.store_master_epoch(resp, done);
                }
                return;
            }
        }

        resp.send_timestamp = now;
        if let Err(err) = self.sender.send(&resp, from) {
            debug!(cell = %msg.cell_id, error = %err, "response send failed");
        }
    }

    /// Apply a deferred learn event: update the previous-lease record and
    /// notify the status listener only when the lease actually changed.
    fn handle_learned(&mut self, cell_id: CellId, lease: Lease) {
        if lease.is_empty() {
            self.leases.remove(&cell_id);
        } else {
            self.leases.insert(cell_id.clone(), lease.clone());
        }
        if self.engine.update_prev_lease(&cell_id, lease.clone()).is_some() {
            debug!(cell = %cell_id, holder = ?lease.holder, timeout = lease.expires_at,
                   "lease status changed");
            self.status.status_changed(cell_id, lease);
        }
    }

    /// Deliver due timers into the engine and report expired leases.
    fn fire_due(&mut self) {
        let now_local = self.clock.local_now();
        let due = self.timers.borrow_mut().pop_due(now_local);
        let now_global = self.clock.global_now();
        for mut msg in due {
            msg.send_timestamp = now_global;
            debug!(cell = %msg.cell_id, kind = ?msg.kind, "timer fired");
            self.engine.process_message(msg);
        }
        self.check_expired_leases();
    }

    fn check_expired_leases(&mut self) {
        let now = self.clock.global_now();
        let expired: Vec<CellId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(cell_id, _)| cell_id.clone())
            .collect();
        for cell_id in expired {
            info!(cell = %cell_id, "lease expired");
            self.leases.remove(&cell_id);
            if self
                .engine
                .update_prev_lease(&cell_id, Lease::empty())
                .is_some()
            {
                self.status.status_changed(cell_id.clone(), Lease::empty());
            }
            // Kick a fresh negotiation once the skew bound guarantees the
            // expiry is visible everywhere. Stale if a round is already
            // running by then.
            if let Some(ballot) = self.engine.current_ballot(&cell_id) {
                let mut timer = Message::new(MessageKind::EventRestart, cell_id.clone());
                timer.proposal_no = ballot;
                self.timers
                    .borrow_mut()
                    .push(timer, self.clock.local_now() + self.config.d_max_ms);
            }
        }
    }
}

//! # Cellease: Quorum-Based Lease Negotiation
//!
//! This crate implements a Paxos-derived lease negotiation protocol in the
//! style of [Flease][flease]: small groups of nodes agree, per resource
//! ("cell"), on a single lease holder for a bounded time window, without
//! any central lock service and without persistent acceptor state.
//!
//! [flease]: https://www.dcl.hpi.uni-potsdam.de/papers/papers/flease_ipdps2010.pdf
//!
//! ## Lease Negotiation vs Classic Paxos: A Mental Model
//!
//! If you're familiar with single-decree Paxos, here's how the concepts map:
//!
//! | This crate | Classic Paxos | Notes |
//! |---|---|---|
//! | **Ballot** (`ProposalNumber`) | Proposal number | `(counter, owner)` pair, totally ordered |
//! | **Cell** | Consensus instance | One independent instance per resource |
//! | **PREPARE / ACCEPT / LEARN** | Phase 1 / Phase 2 / learn | Same message flow |
//! | **Lease value** | Chosen value | `(holder, expiry)` instead of an opaque value |
//! | **Expiry + `d_max`** | *(no equivalent)* | Values become re-proposable once provably expired |
//! | **Quorum = majority + local** | Majority quorum | The co-located acceptor always participates |
//!
//! ## Key Differences from Classic Paxos
//!
//! 1. **Values expire**: a chosen lease stops binding once it is provably
//!    expired under the configured clock-skew bound `d_max`. A proposer that
//!    finds an expired prior value may propose a fresh one, which is what
//!    lets leases move between nodes without explicit release.
//!
//! 2. **Three-valued validity**: with loosely synchronized clocks a lease is
//!    provably expired, provably valid, or inside a grace period where
//!    neither can be shown. The protocol is conservative in the grace
//!    period: the prior value wins and the round backs off until validity is
//!    decidable. Safety is never traded for liveness.
//!
//! 3. **The proposer renews its own lease**: a holder re-runs the round
//!    ahead of expiry (keeping the same holder, extending the expiry), and
//!    can hand the lease over by proposing another node as holder.
//!
//! 4. **Master epochs**: a cell can additionally negotiate a monotonically
//!    increasing epoch that survives holder changes, for fencing stale
//!    masters. An optional collaborator persists epochs durably.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      LeaseStage                          │
//! │   command queue + timer queue, single-threaded loop      │
//! └───────────┬─────────────────────────────┬────────────────┘
//!             │ operations, timers          │ remote requests
//!             ▼                             ▼
//! ┌───────────────────────────┐   ┌─────────────────────────┐
//! │      ProposerEngine       │   │    InMemoryAcceptor     │
//! │  PREPARE/ACCEPT/LEARN     │──▶│  prepared / accepted /  │
//! │  quorum + conflict logic  │   │  learned state per cell │
//! └───────────┬───────────────┘   └─────────────────────────┘
//!             │ send_message / request_timer
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              Communicator / MessageSender                │
//! │        application-provided wire transport               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Core types: `ProposalNumber`, `CellId`, `NodeId`, `MasterEpoch`, `LeaseError` |
//! | [`lease`] | `Lease` value and skew-bounded validity predicates |
//! | [`message`] | Wire messages and timer pseudo-messages |
//! | [`config`] | Per-node configuration |
//! | [`clock`] | Global/local clock seam and `SystemClock` |
//! | [`transport`] | `Communicator` / `MessageSender` seams |
//! | [`acceptor`] | `Acceptor` contract and `InMemoryAcceptor` |
//! | [`cell`] | Per-cell proposer state |
//! | [`proposer`] | The round-driving `ProposerEngine` |
//! | [`stage`] | `LeaseStage` event loop and `StageHandle` |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod acceptor;
pub mod cell;
pub mod clock;
pub mod config;
pub mod lease;
pub mod message;
pub mod proposer;
pub mod stage;
pub mod transport;
pub mod types;

// Re-export key types at crate root for convenience
pub use acceptor::{Acceptor, InMemoryAcceptor};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use lease::Lease;
pub use message::{Message, MessageKind};
pub use proposer::{Listeners, LocalQueue, MasterEpochHandler, ProposerEngine};
pub use stage::{LeaseStage, StageHandle, StatusListener};
pub use transport::{Communicator, MessageSender, SendError};
pub use types::{CellId, LeaseError, MasterEpoch, NodeId, ProposalNumber, Timestamp, ViewId};

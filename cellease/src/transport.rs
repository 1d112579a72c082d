//! Outbound seam: message sending and one-shot timers.
//!
//! The engine never blocks on the network. Sends are fire-and-forget; a
//! failed send to one acceptor only lowers that round's response count.
//! Timers are requested here and fire by re-injecting their payload
//! message into the engine's processing entry point.

use std::net::SocketAddr;

use crate::message::Message;
use crate::types::Timestamp;

/// Failure to hand a message to the transport.
///
/// Callers treat this as reduced quorum participation, never as a round
/// failure.
#[derive(Debug, thiserror::Error)]
#[error("send to {to} failed: {reason}")]
pub struct SendError {
    /// Intended recipient.
    pub to: SocketAddr,
    /// Transport-level description.
    pub reason: String,
}

/// Outbound side of the protocol.
pub trait Communicator {
    /// Fire-and-forget send of one message to one acceptor.
    fn send_message(&self, msg: &Message, to: SocketAddr) -> Result<(), SendError>;

    /// Schedule `msg` for re-delivery to the engine at the given local
    /// time. Stale timers are filtered on delivery, not cancelled.
    fn request_timer(&self, msg: Message, fire_at_local: Timestamp);
}

/// Wire-level sender the embedding application provides to the stage.
///
/// The stage implements [`Communicator`] on top of this: sends are
/// forwarded here, timers are kept in the stage's own queue.
pub trait MessageSender {
    /// Fire-and-forget send of one message to one node.
    fn send(&self, msg: &Message, to: SocketAddr) -> Result<(), SendError>;
}

//! What a session hands back to the process after each step
//!
//! The session task drains these after every input and routes them: signals
//! to the rendezvous connection, frames to the router.

use crate::model::peer::PeerId;
use crate::model::signal::SignalMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagated {
    /// Outbound signaling message addressed to the remote peer.
    Signal(SignalMessage),

    /// Tunneled frame received from the remote peer.
    Frame(PeerId, Vec<u8>),
}

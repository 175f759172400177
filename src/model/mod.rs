//! Data models shared by the negotiator, router and relay
//!
//! Peer ids and roles, session state, and the signaling wire schema.

pub mod peer;
pub mod propagated;
pub mod session;
pub mod signal;

pub use peer::{LocalRole, PeerId};
pub use propagated::Propagated;
pub use session::{Role, SessionId, SessionState, StateCell};
pub use signal::{Event, IceCandidate, Inbound, SdpKind, SessionDescription, SignalMessage};

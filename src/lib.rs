//! LAN emulation over the Internet.
//!
//! Each participant bridges a virtual network interface to one or more
//! transport sessions. Sessions are negotiated peer-to-peer through a
//! signaling rendezvous (WebRTC data channels, star topology with the host as
//! hub), or replaced by a blind UDP relay, or by a direct UDP link to a host
//! found through the room backend. All of them feed the same [`router::Router`].

pub mod app;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod negotiator;
pub mod registry;
pub mod relay;
pub mod router;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod uplink;
pub mod util;

/// Default MTU of the virtual interface, and the size of every read buffer.
pub const DEFAULT_MTU: usize = 1500;

/// Anything shorter cannot be an Ethernet frame (keepalives, hello probes).
pub const MIN_FRAME_LEN: usize = 14;

/// Label of the data channel carrying tunneled frames.
pub const TUNNEL_CHANNEL: &str = "tunnel";

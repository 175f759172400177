//! Error types for every layer of the tunnel.

use std::io;

use thiserror::Error;

/// Fatal before any session state is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Placeholder left unedited in {field}: {value}")]
    Placeholder { field: &'static str, value: String },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Toml parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Affects one session only; the session goes to Failed.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Bad session description: {0}")]
    BadDescription(String),

    #[error("Bad ICE candidate: {0}")]
    BadCandidate(String),

    #[error("Unexpected {0} in the current negotiation state")]
    OutOfOrder(&'static str),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negotiation timed out")]
    Timeout,

    #[error("Failed to bind transport socket: {0}")]
    Bind(#[from] io::Error),
}

/// A frame could not be handed to a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Session is not open")]
    NotOpen,

    #[error("Session queue is full")]
    Full,

    #[error("Session is closed")]
    Closed,
}

/// Virtual interface read/write failure.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device {0} is closed")]
    Closed(String),

    #[error("Device {name} not available: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Device IO error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Whether the loop that hit this error should stop.
    pub fn is_terminal(&self) -> bool {
        match self {
            DeviceError::Closed(_) | DeviceError::Open { .. } => true,
            DeviceError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event {event} is missing field {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_device_is_terminal() {
        assert!(DeviceError::Closed("tap0".into()).is_terminal());
        assert!(DeviceError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_terminal());
    }

    #[test]
    fn test_transient_device_error_is_not_terminal() {
        assert!(!DeviceError::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_terminal());
        assert!(!DeviceError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_terminal());
    }
}

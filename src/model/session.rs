use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Distinguishes two sessions negotiated with the same peer id over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> SessionId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        SessionId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for SessionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Side of the offer/answer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Negotiating = 1,
    Open = 2,
    Closed = 3,
    Failed = 4,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Negotiating,
            2 => SessionState::Open,
            3 => SessionState::Closed,
            _ => SessionState::Failed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Session state published by the owning session task, readable by anyone
/// holding a handle.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: SessionState) -> StateCell {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(*b > *a);
    }

    #[test]
    fn test_state_cell_round_trips_every_state() {
        let cell = StateCell::new(SessionState::Created);
        for state in [
            SessionState::Negotiating,
            SessionState::Open,
            SessionState::Closed,
            SessionState::Failed,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }
}

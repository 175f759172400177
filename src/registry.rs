//! Peer registry
//!
//! The one shared mutable structure of a running instance: remote peer id to
//! the handle of its session. Writers (join, leave, failure) take the lock
//! exclusively; fan-out iterates under the read lock, so it always sees a
//! consistent set of fully constructed sessions.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::model::{PeerId, SessionId};
use crate::session::SessionHandle;

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, SessionHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it replaces for the same id.
    /// The caller is responsible for closing the replaced session.
    pub fn insert(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let peer_id = handle.peer_id().clone();
        let replaced = self.peers.write().insert(peer_id.clone(), handle);
        info!(
            "Registered session with {} (replaced existing: {})",
            peer_id,
            replaced.is_some()
        );
        replaced
    }

    pub fn remove(&self, peer_id: &str) -> Option<SessionHandle> {
        let removed = self.peers.write().remove(peer_id);
        if removed.is_some() {
            info!("Unregistered session with {}", peer_id);
        }
        removed
    }

    /// Remove `peer_id` only if it is still bound to session `id`. A session
    /// that ended after being replaced must not evict its successor.
    pub fn remove_session(&self, peer_id: &str, id: SessionId) -> bool {
        let mut peers = self.peers.write();
        match peers.get(peer_id) {
            Some(handle) if handle.id() == id => {
                peers.remove(peer_id);
                info!("Unregistered session {} with {}", *id, peer_id);
                true
            }
            _ => {
                debug!("Session {} with {} already unregistered", *id, peer_id);
                false
            }
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<SessionHandle> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Call `f` for every Open session except `except`, under the read lock.
    /// `f` must not block. Returns how many sessions were visited.
    pub fn for_each_open<F>(&self, except: Option<&str>, mut f: F) -> usize
    where
        F: FnMut(&SessionHandle),
    {
        let peers = self.peers.read();
        let mut visited = 0;
        for (peer_id, handle) in peers.iter() {
            if Some(&**peer_id) == except || !handle.is_open() {
                continue;
            }
            f(handle);
            visited += 1;
        }
        visited
    }

    /// Empty the registry, handing back every session for teardown.
    pub fn drain(&self) -> Vec<SessionHandle> {
        self.peers.write().drain().map(|(_, handle)| handle).collect()
    }
}

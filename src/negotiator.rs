//! Session negotiator
//!
//! Reacts to rendezvous events: the host opens a session toward every peer
//! that joins, a player answers the offer it receives, and answers and
//! candidates are routed to the session they belong to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::model::{IceCandidate, Inbound, LocalRole, PeerId, Role, SessionDescription, SignalMessage};
use crate::registry::PeerRegistry;
use crate::router::Router;
use crate::session::{run_session, SessionCommand, SessionContext, SessionHandle, SessionMachine, Transport};

/// Candidates kept per peer while no session exists for it yet.
pub const MAX_STAGED_CANDIDATES: usize = 32;

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    async fn create(&self, peer_id: &PeerId, role: Role) -> Result<Self::Transport, NegotiationError>;
}

pub struct Negotiator<F> {
    role: LocalRole,
    factory: F,
    ctx: SessionContext,
    staged: HashMap<PeerId, Vec<IceCandidate>>,
}

impl<F: TransportFactory> Negotiator<F> {
    pub fn new(
        role: LocalRole,
        factory: F,
        registry: Arc<PeerRegistry>,
        router: Arc<Router>,
        signals: mpsc::Sender<SignalMessage>,
        negotiation_timeout: Duration,
    ) -> Self {
        Negotiator {
            role,
            factory,
            ctx: SessionContext {
                signals,
                router,
                registry,
                negotiation_timeout,
            },
            staged: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.ctx.registry
    }

    /// Consume rendezvous messages until the connection side hangs up.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<SignalMessage>) {
        while let Some(msg) = inbound.recv().await {
            self.handle(msg).await;
        }
        debug!("Signaling stream ended, negotiator stopping");
    }

    pub async fn handle(&mut self, msg: SignalMessage) {
        let event = msg.event;
        match msg.into_inbound() {
            Ok(Some(inbound)) => self.dispatch(inbound).await,
            Ok(None) => debug!("Ignoring signaling event {:?}", event),
            Err(e) => warn!("Dropping signaling message: {}", e),
        }
    }

    async fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::ExistingPeers(peers) => match self.role {
                LocalRole::Player => info!(
                    "Joined room with {} peers present, waiting for the host's offer",
                    peers.len()
                ),
                LocalRole::Host => info!("Joined room with {} peers present", peers.len()),
            },
            Inbound::PeerJoined(peer_id) => self.on_peer_joined(peer_id).await,
            Inbound::PeerLeft(peer_id) => self.on_peer_left(&peer_id),
            Inbound::Offer { source, sdp } => self.on_offer(source, sdp).await,
            Inbound::Answer { source, sdp } => self.on_answer(source, sdp).await,
            Inbound::Candidate { source, candidate } => self.on_candidate(source, candidate).await,
        }
    }

    async fn on_peer_joined(&mut self, peer_id: PeerId) {
        if self.role != LocalRole::Host {
            debug!("Peer {} joined, waiting for the host to connect it", peer_id);
            return;
        }
        info!("Peer {} joined, sending offer", peer_id);
        self.open_session(peer_id, Role::Offerer, None).await;
    }

    async fn on_offer(&mut self, source: PeerId, sdp: SessionDescription) {
        if self.role != LocalRole::Player {
            warn!("Host ignoring offer from {}", source);
            return;
        }
        info!("Offer from {}, answering", source);
        self.open_session(source, Role::Answerer, Some(sdp)).await;
    }

    async fn on_answer(&mut self, source: PeerId, sdp: SessionDescription) {
        match self.ctx.registry.get(&source) {
            Some(handle) if handle.role() == Role::Offerer => {
                if handle.deliver(SessionCommand::RemoteAnswer(sdp)).await.is_err() {
                    debug!("Session with {} ended before its answer", source);
                }
            }
            _ => warn!("Answer from {} without a pending offer", source),
        }
    }

    async fn on_candidate(&mut self, source: PeerId, candidate: IceCandidate) {
        if let Some(handle) = self.ctx.registry.get(&source) {
            if handle.deliver(SessionCommand::RemoteCandidate(candidate)).await.is_err() {
                debug!("Session with {} ended, dropping candidate", source);
            }
            return;
        }
        let staged = self.staged.entry(source.clone()).or_default();
        if staged.len() >= MAX_STAGED_CANDIDATES {
            debug!("Too many early candidates from {}, dropping", source);
            return;
        }
        debug!("Staging early candidate from {}", source);
        staged.push(candidate);
    }

    fn on_peer_left(&mut self, peer_id: &PeerId) {
        self.staged.remove(peer_id);
        match self.ctx.registry.remove(peer_id) {
            Some(handle) => {
                info!("Peer {} left, closing its session", peer_id);
                handle.close();
            }
            None => debug!("Peer {} left without a session", peer_id),
        }
    }

    /// Build, start and register a session, replacing any previous one for
    /// the peer. Nothing is registered if negotiation fails synchronously.
    async fn open_session(
        &mut self,
        peer_id: PeerId,
        role: Role,
        offer: Option<SessionDescription>,
    ) -> Option<SessionHandle> {
        let transport = match self.factory.create(&peer_id, role).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Could not create transport for {}: {}", peer_id, e);
                return None;
            }
        };

        let mut machine = SessionMachine::new(peer_id.clone(), role, transport);
        if let Err(e) = machine.start() {
            warn!("Could not start session with {}: {}", peer_id, e);
            return None;
        }
        for candidate in self.staged.remove(&peer_id).unwrap_or_default() {
            machine.handle_command(SessionCommand::RemoteCandidate(candidate));
        }
        if let Some(offer) = offer {
            machine.handle_command(SessionCommand::RemoteOffer(offer));
        }
        if machine.state().is_terminal() {
            warn!("Negotiation with {} failed before it started", peer_id);
            return None;
        }

        let (handle, inbox) = SessionHandle::new(peer_id.clone(), role);
        handle.publish(machine.state());
        if let Some(old) = self.ctx.registry.insert(handle.clone()) {
            info!("Replacing session {} with {}", *old.id(), peer_id);
            old.close();
        }
        tokio::spawn(run_session(machine, inbox, handle.clone(), self.ctx.clone()));
        Some(handle)
    }
}

/// Close every session and wait up to `grace` for their tasks to finish.
pub async fn close_all(registry: &PeerRegistry, grace: Duration) {
    let handles = registry.drain();
    if handles.is_empty() {
        return;
    }
    info!("Closing {} sessions", handles.len());
    for handle in &handles {
        handle.close();
    }
    let deadline = tokio::time::Instant::now() + grace;
    while handles.iter().any(|h| !h.state().is_terminal()) {
        if tokio::time::Instant::now() >= deadline {
            warn!("Some sessions did not close in time");
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

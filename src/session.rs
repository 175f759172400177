//! Transport sessions
//!
//! A session is one logical link with one remote peer. Its negotiation
//! state lives in a [`SessionMachine`], owned by a single task spawned with
//! [`run_session`]. Everyone else talks to the session through a cloneable
//! [`SessionHandle`]: negotiation inputs go in over a command queue, frames
//! over a bounded queue that is never waited on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{NegotiationError, SendError};
use crate::model::{
    IceCandidate, PeerId, Propagated, Role, SessionDescription, SessionId, SessionState,
    SignalMessage, StateCell,
};
use crate::registry::PeerRegistry;
use crate::router::Router;

/// Frames buffered per session before the router starts dropping.
pub const FRAME_QUEUE: usize = 512;

const COMMAND_QUEUE: usize = 64;

/// What a transport reports back to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ChannelOpen,
    Frame(Vec<u8>),
    Failed(String),
    Closed,
}

/// A peer-to-peer transport that can negotiate a datagram channel through an
/// offer/answer exchange plus trickled candidates.
#[async_trait]
pub trait Transport: Send + 'static {
    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), NegotiationError>;

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    /// Candidates gathered for this side, announced once the local
    /// description is set.
    fn local_candidates(&self) -> Vec<IceCandidate>;

    fn send(&mut self, frame: &[u8]) -> Result<(), NegotiationError>;

    /// Drive the transport until it has something to report. Must be cancel
    /// safe: it is polled inside `select!` and dropped on every other event.
    async fn next_event(&mut self) -> TransportEvent;

    fn close(&mut self) {}
}

/// Negotiation input for a session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
}

/// Cloneable reference to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer_id: PeerId,
    role: Role,
    state: Arc<StateCell>,
    commands: mpsc::Sender<SessionCommand>,
    frames: mpsc::Sender<Vec<u8>>,
    close: Arc<watch::Sender<bool>>,
}

/// Receiving ends of a [`SessionHandle`], consumed by the task driving it.
#[derive(Debug)]
pub struct SessionInbox {
    pub commands: mpsc::Receiver<SessionCommand>,
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub close: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn new(peer_id: PeerId, role: Role) -> (SessionHandle, SessionInbox) {
        let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (frames, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (close, close_rx) = watch::channel(false);

        let handle = SessionHandle {
            id: SessionId::next(),
            peer_id,
            role,
            state: Arc::new(StateCell::new(SessionState::Created)),
            commands,
            frames,
            close: Arc::new(close),
        };
        let inbox = SessionInbox {
            commands: commands_rx,
            frames: frames_rx,
            close: close_rx,
        };
        (handle, inbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub(crate) fn publish(&self, state: SessionState) {
        self.state.set(state);
    }

    /// Queue a frame without waiting. Frames are dropped, never delayed.
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        self.frames.try_send(frame.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub async fn deliver(&self, command: SessionCommand) -> Result<(), SendError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Ask the owning task to tear the session down. Idempotent.
    pub fn close(&self) {
        self.close.send_replace(true);
    }
}

/// Offer/answer state machine for one session.
///
/// Remote candidates that arrive before the remote description is applied
/// are buffered, then applied in arrival order right after it.
pub struct SessionMachine<T> {
    peer_id: PeerId,
    role: Role,
    state: SessionState,
    transport: T,
    local_applied: bool,
    remote_applied: bool,
    channel_open: bool,
    pending_candidates: Vec<IceCandidate>,
    outputs: VecDeque<Propagated>,
}

impl<T: Transport> SessionMachine<T> {
    pub fn new(peer_id: PeerId, role: Role, transport: T) -> Self {
        SessionMachine {
            peer_id,
            role,
            state: SessionState::Created,
            transport,
            local_applied: false,
            remote_applied: false,
            channel_open: false,
            pending_candidates: Vec::new(),
            outputs: VecDeque::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Leave Created. The offerer produces its offer right away.
    pub fn start(&mut self) -> Result<(), NegotiationError> {
        if self.state != SessionState::Created {
            return Err(NegotiationError::OutOfOrder("start"));
        }
        self.state = SessionState::Negotiating;
        if self.role == Role::Offerer {
            let offer = match self.transport.create_offer() {
                Ok(offer) => offer,
                Err(e) => {
                    self.state = SessionState::Failed;
                    return Err(e);
                }
            };
            self.local_applied = true;
            self.outputs
                .push_back(Propagated::Signal(SignalMessage::offer(&self.peer_id, offer)));
            self.announce_local_candidates();
        }
        debug!("Session with {} started as {:?}", self.peer_id, self.role);
        Ok(())
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        if self.state.is_terminal() {
            debug!("Dropping {:?} for ended session with {}", command, self.peer_id);
            return;
        }
        let res = match command {
            SessionCommand::RemoteOffer(offer) => self.on_offer(offer),
            SessionCommand::RemoteAnswer(answer) => self.on_answer(answer),
            SessionCommand::RemoteCandidate(candidate) => {
                self.on_candidate(candidate);
                Ok(())
            }
        };
        if let Err(e) = res {
            self.fail(e);
        }
    }

    fn on_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.role != Role::Answerer || self.remote_applied {
            return Err(NegotiationError::OutOfOrder("offer"));
        }
        let answer = self.transport.accept_offer(&offer)?;
        self.remote_applied = true;
        self.local_applied = true;
        self.outputs
            .push_back(Propagated::Signal(SignalMessage::answer(&self.peer_id, answer)));
        self.announce_local_candidates();
        self.flush_pending_candidates();
        self.maybe_open();
        Ok(())
    }

    fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.role != Role::Offerer || !self.local_applied || self.remote_applied {
            return Err(NegotiationError::OutOfOrder("answer"));
        }
        self.transport.accept_answer(&answer)?;
        self.remote_applied = true;
        self.flush_pending_candidates();
        self.maybe_open();
        Ok(())
    }

    fn on_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_applied {
            self.apply_candidate(&candidate);
        } else {
            self.pending_candidates.push(candidate);
        }
    }

    fn apply_candidate(&mut self, candidate: &IceCandidate) {
        // A single unusable candidate leaves the others to carry the session.
        if let Err(e) = self.transport.add_remote_candidate(candidate) {
            warn!("Ignoring candidate from {}: {}", self.peer_id, e);
        }
    }

    fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!("Applying {} buffered candidates from {}", pending.len(), self.peer_id);
        }
        for candidate in &pending {
            self.apply_candidate(candidate);
        }
    }

    fn announce_local_candidates(&mut self) {
        for candidate in self.transport.local_candidates() {
            self.outputs.push_back(Propagated::Signal(SignalMessage::candidate(
                &self.peer_id,
                candidate,
            )));
        }
    }

    fn maybe_open(&mut self) {
        if self.state == SessionState::Negotiating
            && self.local_applied
            && self.remote_applied
            && self.channel_open
        {
            self.state = SessionState::Open;
            info!("Session with {} is open", self.peer_id);
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            TransportEvent::ChannelOpen => {
                self.channel_open = true;
                self.maybe_open();
            }
            TransportEvent::Frame(data) => {
                if self.state == SessionState::Open {
                    self.outputs
                        .push_back(Propagated::Frame(self.peer_id.clone(), data));
                } else {
                    debug!("Dropping early frame from {}", self.peer_id);
                }
            }
            TransportEvent::Failed(reason) => self.fail(NegotiationError::Transport(reason)),
            TransportEvent::Closed => self.close(),
        }
    }

    /// Negotiation deadline passed.
    pub fn on_timeout(&mut self) {
        if !self.state.is_terminal() && self.state != SessionState::Open {
            self.fail(NegotiationError::Timeout);
        }
    }

    pub fn send_frame(&mut self, frame: &[u8]) {
        if self.state != SessionState::Open {
            return;
        }
        if let Err(e) = self.transport.send(frame) {
            debug!("Send to {} failed: {}", self.peer_id, e);
        }
    }

    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            info!("Session with {} closed", self.peer_id);
            self.state = SessionState::Closed;
        }
    }

    fn fail(&mut self, err: NegotiationError) {
        if !self.state.is_terminal() {
            warn!("Session with {} failed: {}", self.peer_id, err);
            self.state = SessionState::Failed;
        }
    }

    pub fn poll_output(&mut self) -> Option<Propagated> {
        self.outputs.pop_front()
    }
}

/// Shared collaborators of every session task.
#[derive(Clone)]
pub struct SessionContext {
    pub signals: mpsc::Sender<SignalMessage>,
    pub router: Arc<Router>,
    pub registry: Arc<PeerRegistry>,
    pub negotiation_timeout: Duration,
}

/// Drive one session until it closes or fails, then unregister it.
pub async fn run_session<T: Transport>(
    mut machine: SessionMachine<T>,
    inbox: SessionInbox,
    handle: SessionHandle,
    ctx: SessionContext,
) {
    let SessionInbox {
        mut commands,
        mut frames,
        mut close,
    } = inbox;
    let deadline = Instant::now() + ctx.negotiation_timeout;

    loop {
        flush_outputs(&mut machine, &ctx);
        handle.publish(machine.state());
        if machine.state().is_terminal() {
            break;
        }
        let negotiating = machine.state() != SessionState::Open;

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => machine.handle_command(command),
                None => machine.close(),
            },
            frame = frames.recv() => match frame {
                Some(frame) => machine.send_frame(&frame),
                None => machine.close(),
            },
            _ = close.changed() => machine.close(),
            event = machine.transport_mut().next_event() => machine.on_transport_event(event),
            _ = tokio::time::sleep_until(deadline), if negotiating => machine.on_timeout(),
        }
    }

    machine.transport_mut().close();
    ctx.registry.remove_session(handle.peer_id(), handle.id());
    info!(
        "Session {} with {} ended: {}",
        *handle.id(),
        handle.peer_id(),
        machine.state()
    );
}

/// Never waits on the signaling queue. A full queue drops the message.
fn flush_outputs<T: Transport>(machine: &mut SessionMachine<T>, ctx: &SessionContext) {
    while let Some(output) = machine.poll_output() {
        match output {
            Propagated::Signal(msg) => match ctx.signals.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(msg)) => warn!(
                    "Signaling queue full, dropping {:?} for {}",
                    msg.event,
                    machine.peer_id()
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Signaling is gone, dropping message for {}", machine.peer_id())
                }
            },
            Propagated::Frame(origin, data) => ctx.router.on_session_frame(&origin, &data),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Scripted transport: records what the machine did, replays events fed
    /// through `events`.
    pub struct MockTransport {
        pub applied: Arc<parking_lot::Mutex<Vec<String>>>,
        pub sent: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
        pub events: mpsc::UnboundedReceiver<TransportEvent>,
        pub reject_sdp: bool,
    }

    impl MockTransport {
        pub fn new() -> (MockTransport, mpsc::UnboundedSender<TransportEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = MockTransport {
                applied: Default::default(),
                sent: Default::default(),
                events: rx,
                reject_sdp: false,
            };
            (transport, tx)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
            self.applied.lock().push("local-offer".into());
            Ok(SessionDescription::offer("v=0 offer"))
        }

        fn accept_offer(
            &mut self,
            offer: &SessionDescription,
        ) -> Result<SessionDescription, NegotiationError> {
            if self.reject_sdp {
                return Err(NegotiationError::BadDescription(offer.sdp.clone()));
            }
            self.applied.lock().push("remote-offer".into());
            Ok(SessionDescription::answer("v=0 answer"))
        }

        fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), NegotiationError> {
            if self.reject_sdp {
                return Err(NegotiationError::BadDescription(answer.sdp.clone()));
            }
            self.applied.lock().push("remote-answer".into());
            Ok(())
        }

        fn add_remote_candidate(
            &mut self,
            candidate: &IceCandidate,
        ) -> Result<(), NegotiationError> {
            self.applied
                .lock()
                .push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        fn local_candidates(&self) -> Vec<IceCandidate> {
            vec![IceCandidate::new("local-host")]
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), NegotiationError> {
            self.sent.lock().push(frame.to_vec());
            Ok(())
        }

        async fn next_event(&mut self) -> TransportEvent {
            match self.events.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use crate::model::Event;

    fn drain(machine: &mut SessionMachine<MockTransport>) -> Vec<Propagated> {
        std::iter::from_fn(|| machine.poll_output()).collect()
    }

    #[test]
    fn test_offerer_emits_offer_then_candidates() {
        let (transport, _events) = MockTransport::new();
        let mut machine = SessionMachine::new(PeerId::from("p1"), Role::Offerer, transport);
        machine.start().unwrap();

        let out = drain(&mut machine);
        assert_eq!(machine.state(), SessionState::Negotiating);
        assert_eq!(out.len(), 2);
        match &out[0] {
            Propagated::Signal(msg) => {
                assert_eq!(msg.event, Event::Offer);
                assert_eq!(msg.target(), Some(PeerId::from("p1")));
            }
            other => panic!("expected offer, got {:?}", other),
        }
        assert!(matches!(&out[1], Propagated::Signal(m) if m.event == Event::Candidate));
    }

    #[test]
    fn test_candidates_before_offer_are_buffered_in_order() {
        let (transport, _events) = MockTransport::new();
        let applied = transport.applied.clone();
        let mut machine = SessionMachine::new(PeerId::from("h"), Role::Answerer, transport);
        machine.start().unwrap();

        machine.handle_command(SessionCommand::RemoteCandidate(IceCandidate::new("c1")));
        machine.handle_command(SessionCommand::RemoteCandidate(IceCandidate::new("c2")));
        assert_eq!(machine.pending_candidates(), 2);
        assert!(applied.lock().is_empty());

        machine.handle_command(SessionCommand::RemoteOffer(SessionDescription::offer("o")));
        machine.handle_command(SessionCommand::RemoteCandidate(IceCandidate::new("c3")));

        assert_eq!(machine.pending_candidates(), 0);
        assert_eq!(
            *applied.lock(),
            vec!["remote-offer", "candidate:c1", "candidate:c2", "candidate:c3"]
        );
        let out = drain(&mut machine);
        assert!(matches!(&out[0], Propagated::Signal(m) if m.event == Event::Answer));
    }

    #[test]
    fn test_opens_only_after_both_descriptions_and_channel() {
        let (transport, _events) = MockTransport::new();
        let mut machine = SessionMachine::new(PeerId::from("p1"), Role::Offerer, transport);
        machine.start().unwrap();

        machine.on_transport_event(TransportEvent::ChannelOpen);
        assert_eq!(machine.state(), SessionState::Negotiating);

        machine.handle_command(SessionCommand::RemoteAnswer(SessionDescription::answer("a")));
        assert_eq!(machine.state(), SessionState::Open);
    }

    #[test]
    fn test_answer_without_offer_fails() {
        let (transport, _events) = MockTransport::new();
        let mut machine = SessionMachine::new(PeerId::from("h"), Role::Answerer, transport);
        machine.start().unwrap();

        machine.handle_command(SessionCommand::RemoteAnswer(SessionDescription::answer("a")));
        assert_eq!(machine.state(), SessionState::Failed);
    }

    #[test]
    fn test_bad_offer_fails_session() {
        let (mut transport, _events) = MockTransport::new();
        transport.reject_sdp = true;
        let mut machine = SessionMachine::new(PeerId::from("h"), Role::Answerer, transport);
        machine.start().unwrap();

        machine.handle_command(SessionCommand::RemoteOffer(SessionDescription::offer("bad")));
        assert_eq!(machine.state(), SessionState::Failed);
        assert!(drain(&mut machine).is_empty());
    }

    #[test]
    fn test_timeout_only_affects_unopened_sessions() {
        let (transport, _events) = MockTransport::new();
        let mut machine = SessionMachine::new(PeerId::from("p1"), Role::Offerer, transport);
        machine.start().unwrap();
        machine.handle_command(SessionCommand::RemoteAnswer(SessionDescription::answer("a")));
        machine.on_transport_event(TransportEvent::ChannelOpen);

        machine.on_timeout();
        assert_eq!(machine.state(), SessionState::Open);

        let (transport, _events) = MockTransport::new();
        let mut stalled = SessionMachine::new(PeerId::from("p2"), Role::Offerer, transport);
        stalled.start().unwrap();
        stalled.on_timeout();
        assert_eq!(stalled.state(), SessionState::Failed);
    }

    #[test]
    fn test_frames_flow_only_when_open() {
        let (transport, _events) = MockTransport::new();
        let sent = transport.sent.clone();
        let mut machine = SessionMachine::new(PeerId::from("h"), Role::Answerer, transport);
        machine.start().unwrap();

        machine.send_frame(b"early");
        assert!(sent.lock().is_empty());

        machine.handle_command(SessionCommand::RemoteOffer(SessionDescription::offer("o")));
        machine.on_transport_event(TransportEvent::ChannelOpen);
        drain(&mut machine);

        machine.send_frame(b"late");
        machine.on_transport_event(TransportEvent::Frame(b"inbound".to_vec()));

        assert_eq!(*sent.lock(), vec![b"late".to_vec()]);
        match drain(&mut machine).pop() {
            Some(Propagated::Frame(origin, data)) => {
                assert_eq!(origin, PeerId::from("h"));
                assert_eq!(data, b"inbound");
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let (transport, _events) = MockTransport::new();
        let mut machine = SessionMachine::new(PeerId::from("p1"), Role::Offerer, transport);
        machine.start().unwrap();
        machine.close();
        machine.on_transport_event(TransportEvent::Failed("late".into()));
        machine.on_transport_event(TransportEvent::ChannelOpen);
        assert_eq!(machine.state(), SessionState::Closed);
        assert!(machine.start().is_err());
    }

    #[test]
    fn test_handle_rejects_frames_until_open() {
        let (handle, mut inbox) = SessionHandle::new(PeerId::from("p1"), Role::Offerer);
        assert_eq!(handle.send_frame(b"x"), Err(SendError::NotOpen));

        handle.publish(SessionState::Open);
        handle.send_frame(b"x").unwrap();
        assert_eq!(inbox.frames.try_recv().unwrap(), b"x".to_vec());
    }

    #[test]
    fn test_handle_drops_when_queue_full() {
        let (handle, _inbox) = SessionHandle::new(PeerId::from("p1"), Role::Offerer);
        handle.publish(SessionState::Open);
        for _ in 0..FRAME_QUEUE {
            handle.send_frame(b"x").unwrap();
        }
        assert_eq!(handle.send_frame(b"x"), Err(SendError::Full));
    }
}

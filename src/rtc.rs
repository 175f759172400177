//! WebRTC data-channel transport
//!
//! Each session owns one sans-IO [`Rtc`] instance and one UDP socket bound to
//! the host address. `next_event` drives the instance: transmits go out on
//! the socket, inbound datagrams and timeouts go back in, and the events a
//! session cares about come out.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::model::{IceCandidate, PeerId, Role, SessionDescription};
use crate::negotiator::TransportFactory;
use crate::session::{Transport, TransportEvent};
use crate::util::{select_host_address, stun};
use crate::TUNNEL_CHANNEL;

const STUN_TIMEOUT: Duration = Duration::from_secs(2);
const RECV_BUFFER: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct RtcSettings {
    /// `host:port` of a STUN server for a server-reflexive candidate.
    pub stun_server: Option<String>,
    /// Address to bind and advertise instead of the detected one.
    pub host_ip: Option<IpAddr>,
}

/// Builds one [`RtcTransport`] per session.
#[derive(Debug, Clone, Default)]
pub struct RtcFactory {
    settings: RtcSettings,
}

impl RtcFactory {
    pub fn new(settings: RtcSettings) -> Self {
        RtcFactory { settings }
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    type Transport = RtcTransport;

    async fn create(&self, peer_id: &PeerId, role: Role) -> Result<RtcTransport, NegotiationError> {
        debug!("Creating WebRTC transport for {} as {:?}", peer_id, role);
        RtcTransport::bind(&self.settings).await
    }
}

pub struct RtcTransport {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    channel: Option<ChannelId>,
    pending: Option<SdpPendingOffer>,
    local_candidates: Vec<IceCandidate>,
    buf: Vec<u8>,
}

impl RtcTransport {
    pub async fn bind(settings: &RtcSettings) -> Result<RtcTransport, NegotiationError> {
        let host = settings
            .host_ip
            .or_else(select_host_address)
            .ok_or_else(|| NegotiationError::Transport("found no usable network interface".into()))?;

        let socket = UdpSocket::bind(SocketAddr::new(host, 0)).await?;
        let local_addr = socket.local_addr()?;

        let mut rtc = Rtc::builder().build();
        let mut local_candidates = Vec::new();

        match Candidate::host(local_addr, "udp") {
            Ok(candidate) => {
                local_candidates.push(IceCandidate::new(candidate.to_sdp_string()));
                rtc.add_local_candidate(candidate);
            }
            Err(e) => warn!("Host candidate for {} rejected: {}", local_addr, e),
        }

        if let Some(server) = &settings.stun_server {
            match stun::query(&socket, server, STUN_TIMEOUT).await {
                Ok(Some(mapped)) if mapped != local_addr => {
                    match Candidate::server_reflexive(mapped, local_addr, "udp") {
                        Ok(candidate) => {
                            info!("Public mapping of {} is {}", local_addr, mapped);
                            local_candidates.push(IceCandidate::new(candidate.to_sdp_string()));
                            rtc.add_local_candidate(candidate);
                        }
                        Err(e) => warn!("Reflexive candidate for {} rejected: {}", mapped, e),
                    }
                }
                Ok(_) => debug!("No reflexive candidate from {}", server),
                Err(e) => warn!("STUN query to {} failed: {}", server, e),
            }
        }

        info!("WebRTC transport bound to {}", local_addr);
        Ok(RtcTransport {
            rtc,
            socket,
            local_addr,
            channel: None,
            pending: None,
            local_candidates,
            buf: vec![0; RECV_BUFFER],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn translate(&mut self, event: Event) -> Option<TransportEvent> {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE connection state on {}: {:?}", self.local_addr, state);
                if state == IceConnectionState::Disconnected {
                    Some(TransportEvent::Failed("ICE disconnected".into()))
                } else {
                    None
                }
            }
            Event::ChannelOpen(id, label) => {
                if label != TUNNEL_CHANNEL {
                    debug!("Ignoring unexpected channel '{}'", label);
                    return None;
                }
                self.channel = Some(id);
                Some(TransportEvent::ChannelOpen)
            }
            Event::ChannelData(data) => {
                if Some(data.id) == self.channel {
                    Some(TransportEvent::Frame(data.data))
                } else {
                    None
                }
            }
            Event::ChannelClose(id) => {
                if Some(id) == self.channel {
                    Some(TransportEvent::Closed)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

fn to_wire<T: Serialize>(sdp: &T) -> Result<SessionDescription, NegotiationError> {
    serde_json::to_value(sdp)
        .and_then(serde_json::from_value)
        .map_err(|e| NegotiationError::BadDescription(e.to_string()))
}

fn from_wire<T: DeserializeOwned>(desc: &SessionDescription) -> Result<T, NegotiationError> {
    serde_json::to_value(desc)
        .and_then(serde_json::from_value)
        .map_err(|e| NegotiationError::BadDescription(e.to_string()))
}

#[async_trait]
impl Transport for RtcTransport {
    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let mut change = self.rtc.sdp_api();
        let cid = change.add_channel(TUNNEL_CHANNEL.to_string());
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| NegotiationError::BadDescription("nothing to offer".into()))?;
        debug!("Requested data channel '{}' with id {:?}", TUNNEL_CHANNEL, cid);
        self.pending = Some(pending);
        to_wire(&offer)
    }

    fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let offer: SdpOffer = from_wire(offer)?;
        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| NegotiationError::BadDescription(e.to_string()))?;
        to_wire(&answer)
    }

    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), NegotiationError> {
        let pending = self
            .pending
            .take()
            .ok_or(NegotiationError::OutOfOrder("answer"))?;
        let answer: SdpAnswer = from_wire(answer)?;
        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| NegotiationError::BadDescription(e.to_string()))
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        // End-of-candidates marker.
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        let c = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| NegotiationError::BadCandidate(e.to_string()))?;
        self.rtc.add_remote_candidate(c);
        Ok(())
    }

    fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates.clone()
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), NegotiationError> {
        let mut channel = self
            .channel
            .and_then(|id| self.rtc.channel(id))
            .ok_or_else(|| NegotiationError::Transport("channel not open".into()))?;
        channel
            .write(true, frame)
            .map(|_| ())
            .map_err(|e| NegotiationError::Transport(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            let timeout = match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => t,
                Ok(Output::Transmit(t)) => {
                    if let Err(e) = self.socket.try_send_to(&t.contents, t.destination) {
                        debug!("Dropped transmit to {}: {}", t.destination, e);
                    }
                    continue;
                }
                Ok(Output::Event(event)) => match self.translate(event) {
                    Some(event) => return event,
                    None => continue,
                },
                Err(e) => return TransportEvent::Failed(e.to_string()),
            };

            if !self.rtc.is_alive() {
                return TransportEvent::Closed;
            }

            let now = Instant::now();
            let wait = timeout.saturating_duration_since(now);
            let input = if wait.is_zero() {
                Input::Timeout(now)
            } else {
                self.buf.resize(RECV_BUFFER, 0);
                match tokio::time::timeout(wait, self.socket.recv_from(&mut self.buf)).await {
                    Ok(Ok((n, source))) => {
                        self.buf.truncate(n);
                        match self.buf.as_slice().try_into() {
                            Ok(contents) => Input::Receive(
                                Instant::now(),
                                Receive {
                                    proto: Protocol::Udp,
                                    source,
                                    destination: self.local_addr,
                                    contents,
                                },
                            ),
                            Err(e) => {
                                debug!("Unrecognized datagram from {}: {:?}", source, e);
                                continue;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("Receive on {} failed: {}", self.local_addr, e);
                        continue;
                    }
                    Err(_) => Input::Timeout(Instant::now()),
                }
            };

            if let Err(e) = self.rtc.handle_input(input) {
                return TransportEvent::Failed(e.to_string());
            }
        }
    }

    fn close(&mut self) {
        self.rtc.disconnect();
    }
}

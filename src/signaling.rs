//! Rendezvous connection
//!
//! Keeps one WebSocket open to the signaling server, re-joining the room on
//! every (re)connect. Inbound messages are handed to the negotiator as-is;
//! outbound ones are stamped with the room before they go on the wire.

use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::model::SignalMessage;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Doubling reconnect delay, reset after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

enum Exit {
    Shutdown,
    Disconnected(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SignalingClient {
    url: String,
    room: String,
    backoff: Backoff,
}

impl SignalingClient {
    pub fn new(url: impl Into<String>, room: impl Into<String>) -> Self {
        SignalingClient {
            url: url.into(),
            room: room.into(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until `shutdown` flips or the negotiator drops `inbound`.
    pub async fn run(
        mut self,
        inbound: mpsc::Sender<SignalMessage>,
        mut outbound: mpsc::Receiver<SignalMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let connected = tokio::select! {
                res = connect_async(self.url.as_str()) => res,
                _ = shutdown.changed() => return,
            };
            match connected {
                Ok((stream, _)) => {
                    info!("Connected to signaling server {}", self.url);
                    self.backoff.reset();
                    match self.session(stream, &inbound, &mut outbound, &mut shutdown).await {
                        Exit::Shutdown => return,
                        Exit::Disconnected(reason) => warn!("Signaling connection lost: {}", reason),
                    }
                }
                Err(e) => warn!("Failed to connect to {}: {}", self.url, SignalingError::from(e)),
            }

            let delay = self.backoff.next_delay();
            info!("Reconnecting to signaling server in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn session(
        &self,
        stream: WsStream,
        inbound: &mpsc::Sender<SignalMessage>,
        outbound: &mut mpsc::Receiver<SignalMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let (mut tx, mut rx) = stream.split();

        if let Err(e) = send(&mut tx, SignalMessage::join_room(self.room.clone())).await {
            return Exit::Disconnected(e.to_string());
        }
        info!("Joined room {}", self.room);

        loop {
            tokio::select! {
                msg = rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(msg) => {
                            debug!("Signal in: {:?}", msg.event);
                            if inbound.send(msg).await.is_err() {
                                return Exit::Shutdown;
                            }
                        }
                        Err(e) => warn!("{}", SignalingError::from(e)),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Exit::Disconnected("closed by server".into())
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Exit::Disconnected(e.to_string()),
                },
                out = outbound.recv() => match out {
                    Some(msg) => {
                        let msg = msg.with_room(&self.room);
                        if let Err(e) = send(&mut tx, msg).await {
                            return Exit::Disconnected(e.to_string());
                        }
                    }
                    None => {
                        let _ = tx.close().await;
                        return Exit::Shutdown;
                    }
                },
                _ = shutdown.changed() => {
                    let _ = tx.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                }
            }
        }
    }
}

async fn send<S>(tx: &mut S, msg: SignalMessage) -> Result<(), SignalingError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    debug!("Signal out: {:?}", msg.event);
    let text = serde_json::to_string(&msg)?;
    tx.send(Message::Text(text)).await?;
    Ok(())
}

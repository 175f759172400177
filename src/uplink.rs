//! UDP uplinks
//!
//! Sessions that need no negotiation: a connected socket toward the relay
//! (or a directly reachable host), and the host side of direct mode, where
//! every source address on one socket becomes its own session. Both are
//! registered like negotiated sessions, so the router treats them the same.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::model::{PeerId, Role, SessionState};
use crate::registry::PeerRegistry;
use crate::relay::ClientTable;
use crate::router::Router;
use crate::session::{SessionHandle, SessionInbox};

/// Sent on connect and on every keepalive tick. Shorter than any Ethernet
/// frame, so receivers drop it before the interface.
pub const HELLO: &[u8] = b"lanlink-hello";

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

const MAX_DATAGRAM: usize = 65_535;

pub fn peer_id_for(addr: SocketAddr) -> PeerId {
    PeerId::new(format!("udp:{addr}"))
}

/// Run one uplink over a connected socket until `shutdown` flips.
pub async fn run_uplink(
    socket: UdpSocket,
    router: Arc<Router>,
    registry: Arc<PeerRegistry>,
    keepalive: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let remote = socket.peer_addr()?;
    let peer_id = peer_id_for(remote);
    let (handle, inbox) = SessionHandle::new(peer_id.clone(), Role::Offerer);
    let SessionInbox {
        mut frames,
        mut close,
        ..
    } = inbox;

    handle.publish(SessionState::Open);
    if let Some(old) = registry.insert(handle.clone()) {
        old.close();
    }
    info!("Uplink {} -> {} open", socket.local_addr()?, remote);

    if let Err(e) = socket.send(HELLO).await {
        warn!("Hello to {} failed: {}", remote, e);
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut ticker = tokio::time::interval(keepalive);
    ticker.tick().await;

    loop {
        tokio::select! {
            res = socket.recv(&mut buf) => match res {
                Ok(n) => router.on_session_frame(&peer_id, &buf[..n]),
                Err(e) => debug!("Uplink receive error from {}: {}", remote, e),
            },
            Some(frame) = frames.recv() => {
                if let Err(e) = socket.send(&frame).await {
                    debug!("Uplink send to {} failed: {}", remote, e);
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = socket.send(HELLO).await {
                    debug!("Keepalive to {} failed: {}", remote, e);
                }
            },
            _ = close.changed() => break,
            _ = shutdown.changed() => break,
        }
    }

    handle.publish(SessionState::Closed);
    registry.remove_session(&peer_id, handle.id());
    info!("Uplink to {} closed", remote);
    Ok(())
}

/// Host side of direct mode: one socket, one session per source address.
/// Clients silent for three keepalive periods are dropped.
pub async fn run_udp_hub(
    socket: UdpSocket,
    router: Arc<Router>,
    registry: Arc<PeerRegistry>,
    keepalive: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let socket = Arc::new(socket);
    info!("Direct hub listening on {}", socket.local_addr()?);

    let idle = keepalive * 3;
    let mut table = ClientTable::new();
    let mut handles: Vec<(SocketAddr, SessionHandle)> = Vec::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(keepalive);

    loop {
        tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, source)) => {
                    if table.observe(source, Instant::now()) {
                        let handle = spawn_hub_session(socket.clone(), source, &registry);
                        handles.push((source, handle));
                    }
                    router.on_session_frame(&peer_id_for(source), &buf[..n]);
                }
                Err(e) => debug!("Hub receive error: {}", e),
            },
            _ = sweep.tick() => {
                for addr in table.evict_idle(Instant::now(), idle) {
                    info!("Direct client {} went silent", addr);
                    handles.retain(|(a, handle)| {
                        if *a == addr {
                            handle.close();
                            false
                        } else {
                            true
                        }
                    });
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    for (_, handle) in handles {
        handle.close();
    }
    Ok(())
}

fn spawn_hub_session(
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    registry: &Arc<PeerRegistry>,
) -> SessionHandle {
    let peer_id = peer_id_for(addr);
    let (handle, inbox) = SessionHandle::new(peer_id.clone(), Role::Answerer);
    handle.publish(SessionState::Open);
    if let Some(old) = registry.insert(handle.clone()) {
        old.close();
    }
    info!("Direct client {} connected", addr);

    let task_handle = handle.clone();
    let registry = registry.clone();
    tokio::spawn(async move {
        let SessionInbox {
            mut frames,
            mut close,
            ..
        } = inbox;
        loop {
            tokio::select! {
                Some(frame) = frames.recv() => {
                    if let Err(e) = socket.send_to(&frame, addr).await {
                        debug!("Send to direct client {} failed: {}", addr, e);
                    }
                },
                _ = close.changed() => break,
            }
        }
        task_handle.publish(SessionState::Closed);
        registry.remove_session(&peer_id, task_handle.id());
    });
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryInterface;
    use crate::model::LocalRole;

    fn frame(tag: u8) -> Vec<u8> {
        let mut f = vec![0xff; 14];
        f.push(tag);
        f
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_uplink_bridges_socket_and_interface() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        local.connect(remote.local_addr().unwrap()).await.unwrap();
        let local_addr = local.local_addr().unwrap();

        let registry = Arc::new(PeerRegistry::new());
        let device = Arc::new(MemoryInterface::new("mem0"));
        let router = Arc::new(Router::new(LocalRole::Player, registry.clone(), device.clone(), 1500));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(run_uplink(
            local,
            router.clone(),
            registry.clone(),
            Duration::from_secs(60),
            shutdown,
        ));

        let mut buf = [0u8; 64];
        let (n, from) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], HELLO);
        assert_eq!(from, local_addr);

        remote.send_to(&frame(1), local_addr).await.unwrap();
        eventually(|| device.written() == vec![frame(1)]).await;

        router.on_device_frame(&frame(2));
        let (n, _) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], frame(2).as_slice());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_hub_refans_between_direct_clients() {
        let hub_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hub_addr = hub_socket.local_addr().unwrap();
        let registry = Arc::new(PeerRegistry::new());
        let device = Arc::new(MemoryInterface::new("mem0"));
        let router = Arc::new(Router::new(LocalRole::Host, registry.clone(), device.clone(), 1500));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(run_udp_hub(
            hub_socket,
            router,
            registry.clone(),
            Duration::from_secs(60),
            shutdown,
        ));

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(HELLO, hub_addr).await.unwrap();
        b.send_to(HELLO, hub_addr).await.unwrap();
        eventually(|| registry.len() == 2).await;

        a.send_to(&frame(9), hub_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], frame(9).as_slice());
        eventually(|| device.written() == vec![frame(9)]).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        eventually(|| registry.is_empty()).await;
    }
}

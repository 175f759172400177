//! One entry point per deployment role. Each validates its settings, wires
//! the components together, runs until Ctrl-C and then tears down in order:
//! sessions, interface, signaling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::backend::{BackendClient, RoomDirectory};
use crate::config::{prompt_room, Settings};
use crate::device::VirtualInterface;
use crate::model::LocalRole;
use crate::negotiator::{close_all, Negotiator};
use crate::registry::PeerRegistry;
use crate::relay::{RelayConfig, RelayServer};
use crate::router::Router;
use crate::rtc::{RtcFactory, RtcSettings};
use crate::signaling::SignalingClient;
use crate::uplink::{run_udp_hub, run_uplink};
use crate::util::select_host_address;

const SIGNAL_QUEUE: usize = 256;
const SESSION_GRACE: Duration = Duration::from_secs(2);

/// Attach to the configured interface.
pub fn open_interface(settings: &Settings) -> Result<Arc<dyn VirtualInterface>> {
    let name = settings.require_interface()?;
    #[cfg(target_os = "linux")]
    {
        let device = crate::device::tap::TapDevice::attach(name)?;
        Ok(Arc::new(device))
    }
    #[cfg(not(target_os = "linux"))]
    {
        bail!("TAP interface {} is only supported on Linux", name)
    }
}

/// Room from the settings, or asked for on the terminal.
pub fn resolve_room(settings: &Settings) -> Result<String> {
    match settings.room.as_deref().map(str::trim) {
        Some(room) if !room.is_empty() => Ok(room.to_string()),
        _ => Ok(prompt_room(std::io::stdin().lock(), std::io::stdout())?),
    }
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
    }
}

async fn stop_device(device: &Arc<dyn VirtualInterface>, reader: JoinHandle<()>) {
    device.close();
    if tokio::task::spawn_blocking(move || reader.join()).await.is_err() {
        warn!("Interface reader did not stop cleanly");
    }
}

/// Peer-to-peer mode over WebRTC data channels.
pub async fn run_peer(
    role: LocalRole,
    settings: &Settings,
    room: String,
    device: Arc<dyn VirtualInterface>,
) -> Result<()> {
    let url = settings.require_signaling_url()?.to_string();
    let mtu = settings.require_mtu()?;

    let registry = Arc::new(PeerRegistry::new());
    let router = Arc::new(Router::new(role, registry.clone(), device.clone(), mtu));
    let reader = router.spawn_device_reader()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (inbound_tx, inbound_rx) = mpsc::channel(SIGNAL_QUEUE);
    let (outbound_tx, outbound_rx) = mpsc::channel(SIGNAL_QUEUE);

    let factory = RtcFactory::new(RtcSettings {
        stun_server: settings.stun_server.clone(),
        host_ip: settings.host_ip,
    });
    let negotiator = Negotiator::new(
        role,
        factory,
        registry.clone(),
        router.clone(),
        outbound_tx,
        settings.negotiation_timeout(),
    );

    info!("Running as {} in room {} on {}", role, room, device.name());
    let signaling =
        tokio::spawn(SignalingClient::new(url, room).run(inbound_tx, outbound_rx, shutdown_rx));
    let negotiating = tokio::spawn(negotiator.run(inbound_rx));

    wait_for_ctrl_c().await;

    negotiating.abort();
    close_all(&registry, SESSION_GRACE).await;
    stop_device(&device, reader).await;
    shutdown_tx.send_replace(true);
    if let Err(e) = signaling.await {
        warn!("Signaling task ended abnormally: {}", e);
    }
    router.log_summary();
    Ok(())
}

/// Blind UDP relay.
pub async fn run_relay(settings: &Settings) -> Result<()> {
    let config = RelayConfig {
        bind: settings.relay_bind_addr()?,
        idle_timeout: settings.relay_idle_timeout(),
    };
    let server = RelayServer::bind(&config)
        .await
        .with_context(|| format!("binding relay on {}", config.bind))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(server.run(shutdown_rx));
    wait_for_ctrl_c().await;
    shutdown_tx.send_replace(true);
    relay.await??;
    Ok(())
}

async fn run_uplink_mode(
    remote: SocketAddr,
    settings: &Settings,
    device: Arc<dyn VirtualInterface>,
) -> Result<()> {
    let mtu = settings.require_mtu()?;
    let registry = Arc::new(PeerRegistry::new());
    // The far end does the fan-out; this side never re-sends a frame.
    let router = Arc::new(Router::new(LocalRole::Player, registry.clone(), device.clone(), mtu));
    let reader = router.spawn_device_reader()?;

    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    socket.connect(remote).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let uplink = tokio::spawn(run_uplink(
        socket,
        router.clone(),
        registry,
        settings.keepalive(),
        shutdown_rx,
    ));

    wait_for_ctrl_c().await;

    shutdown_tx.send_replace(true);
    uplink.await??;
    stop_device(&device, reader).await;
    router.log_summary();
    Ok(())
}

/// Bridge the interface to a relay server.
pub async fn run_relay_client(settings: &Settings, device: Arc<dyn VirtualInterface>) -> Result<()> {
    let relay = settings.require_relay_addr()?;
    info!("Connecting to relay {}", relay);
    run_uplink_mode(relay, settings, device).await
}

/// Join a direct-mode room and connect to its host.
pub async fn run_direct_player(
    settings: &Settings,
    room: String,
    device: Arc<dyn VirtualInterface>,
) -> Result<()> {
    let backend = BackendClient::new(settings.require_backend_url()?);
    let endpoint = backend.join_room(&room).await?;
    let host = endpoint
        .socket_addr()
        .with_context(|| format!("backend returned bad endpoint {}", endpoint.player_ip))?;
    info!("Room {} is hosted at {}", room, host);
    run_uplink_mode(host, settings, device).await
}

/// Announce a direct-mode room and act as its hub.
pub async fn run_direct_host(settings: &Settings, device: Arc<dyn VirtualInterface>) -> Result<()> {
    let backend = BackendClient::new(settings.require_backend_url()?);
    let mtu = settings.require_mtu()?;

    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], settings.direct_port)))
        .await
        .with_context(|| format!("binding direct port {}", settings.direct_port))?;
    let port = socket.local_addr()?.port();

    let ip = match &settings.public_ip {
        Some(ip) => ip.clone(),
        None => match backend.public_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Public IP lookup failed ({}), advertising a local address", e);
                select_host_address()
                    .map(|ip| ip.to_string())
                    .ok_or_else(|| anyhow!("found no address to advertise"))?
            }
        },
    };
    let room = backend.create_room(&ip, port).await?;
    info!("Room {} announced for {}:{}", room, ip, port);

    let registry = Arc::new(PeerRegistry::new());
    let router = Arc::new(Router::new(LocalRole::Host, registry.clone(), device.clone(), mtu));
    let reader = router.spawn_device_reader()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = tokio::spawn(run_udp_hub(
        socket,
        router.clone(),
        registry.clone(),
        settings.keepalive(),
        shutdown_rx,
    ));

    wait_for_ctrl_c().await;

    shutdown_tx.send_replace(true);
    hub.await??;
    close_all(&registry, SESSION_GRACE).await;
    stop_device(&device, reader).await;
    router.log_summary();
    Ok(())
}

/// Serve the room directory over HTTP.
pub async fn run_backend(bind: SocketAddr) -> Result<()> {
    let directory = Arc::new(RoomDirectory::new());
    let server = rouille::Server::new(bind, move |request| directory.handle(request))
        .map_err(|e| anyhow!("starting backend on {}: {}", bind, e))?;
    info!("Backend listening on http://{}", server.server_addr());

    let (handle, stop) = server.stoppable();
    wait_for_ctrl_c().await;
    let _ = stop.send(());
    if tokio::task::spawn_blocking(move || handle.join()).await.is_err() {
        bail!("backend server thread panicked");
    }
    Ok(())
}

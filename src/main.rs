use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lanlink::app;
use lanlink::backend::DEFAULT_BACKEND_PORT;
use lanlink::config::Settings;
use lanlink::model::LocalRole;

#[derive(Parser, Debug)]
#[command(name = "lanlink", version, about = "LAN emulation over the Internet")]
struct Cli {
    /// TOML settings file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a room: offer a data channel to every player that joins.
    Host(PeerArgs),
    /// Join a room and answer the host's offer.
    Player(PeerArgs),
    /// Run the UDP relay server.
    Relay(RelayArgs),
    /// Bridge the interface to a relay server.
    RelayClient(RelayClientArgs),
    /// Announce a direct UDP room through the backend and act as its hub.
    DirectHost(DirectHostArgs),
    /// Join a direct UDP room found through the backend.
    DirectPlayer(DirectPlayerArgs),
    /// Serve the room backend.
    Backend(BackendArgs),
}

#[derive(Args, Debug)]
struct InterfaceArgs {
    /// TAP interface to attach to.
    #[arg(short, long)]
    iface: Option<String>,

    #[arg(long)]
    mtu: Option<usize>,
}

#[derive(Args, Debug)]
struct PeerArgs {
    /// Rendezvous server, ws://host:port.
    #[arg(short, long, env = "LANLINK_SIGNALING_URL")]
    signaling: Option<String>,

    #[arg(short, long)]
    room: Option<String>,

    #[command(flatten)]
    interface: InterfaceArgs,

    /// STUN server, host:port.
    #[arg(long)]
    stun: Option<String>,

    /// Only offer host candidates.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_stun: bool,

    /// Address to bind and advertise instead of the detected one.
    #[arg(long)]
    host_ip: Option<IpAddr>,

    #[arg(long)]
    negotiation_timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct RelayArgs {
    #[arg(short, long)]
    bind: Option<String>,

    /// Forget clients silent this many seconds.
    #[arg(long)]
    idle_timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct RelayClientArgs {
    /// Relay server, host:port.
    #[arg(long, env = "LANLINK_RELAY")]
    relay: Option<String>,

    #[command(flatten)]
    interface: InterfaceArgs,

    #[arg(long)]
    keepalive: Option<u64>,
}

#[derive(Args, Debug)]
struct DirectHostArgs {
    #[arg(long, env = "LANLINK_BACKEND")]
    backend: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Address to announce instead of asking a lookup service.
    #[arg(long)]
    public_ip: Option<String>,

    #[command(flatten)]
    interface: InterfaceArgs,

    #[arg(long)]
    keepalive: Option<u64>,
}

#[derive(Args, Debug)]
struct DirectPlayerArgs {
    #[arg(long, env = "LANLINK_BACKEND")]
    backend: Option<String>,

    #[arg(short, long)]
    room: Option<String>,

    #[command(flatten)]
    interface: InterfaceArgs,

    #[arg(long)]
    keepalive: Option<u64>,
}

#[derive(Args, Debug)]
struct BackendArgs {
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_BACKEND_PORT)))]
    bind: SocketAddr,
}

fn init_log(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn apply_interface(settings: &mut Settings, args: InterfaceArgs) {
    if args.iface.is_some() {
        settings.interface = args.iface;
    }
    if let Some(mtu) = args.mtu {
        settings.mtu = mtu;
    }
}

fn apply_peer(settings: &mut Settings, args: PeerArgs) {
    if args.signaling.is_some() {
        settings.signaling_url = args.signaling;
    }
    if args.room.is_some() {
        settings.room = args.room;
    }
    if args.stun.is_some() {
        settings.stun_server = args.stun;
    }
    if args.no_stun {
        settings.stun_server = None;
    }
    if args.host_ip.is_some() {
        settings.host_ip = args.host_ip;
    }
    if let Some(secs) = args.negotiation_timeout {
        settings.negotiation_timeout_secs = secs;
    }
    apply_interface(settings, args.interface);
}

fn apply_keepalive(settings: &mut Settings, keepalive: Option<u64>) {
    if let Some(secs) = keepalive {
        settings.keepalive_secs = secs;
    }
}

async fn run_peer(role: LocalRole, mut settings: Settings, args: PeerArgs) -> Result<()> {
    apply_peer(&mut settings, args);
    settings.require_signaling_url()?;
    let room = app::resolve_room(&settings)?;
    let device = app::open_interface(&settings)?;
    app::run_peer(role, &settings, room, device).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log(cli.debug);

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    match cli.command {
        Command::Host(args) => run_peer(LocalRole::Host, settings, args).await,
        Command::Player(args) => run_peer(LocalRole::Player, settings, args).await,
        Command::Relay(args) => {
            if let Some(bind) = args.bind {
                settings.relay_bind = bind;
            }
            if args.idle_timeout.is_some() {
                settings.relay_idle_timeout_secs = args.idle_timeout;
            }
            app::run_relay(&settings).await
        }
        Command::RelayClient(args) => {
            if args.relay.is_some() {
                settings.relay_addr = args.relay;
            }
            apply_keepalive(&mut settings, args.keepalive);
            apply_interface(&mut settings, args.interface);
            settings.require_relay_addr()?;
            let device = app::open_interface(&settings)?;
            app::run_relay_client(&settings, device).await
        }
        Command::DirectHost(args) => {
            if args.backend.is_some() {
                settings.backend_url = args.backend;
            }
            if let Some(port) = args.port {
                settings.direct_port = port;
            }
            if args.public_ip.is_some() {
                settings.public_ip = args.public_ip;
            }
            apply_keepalive(&mut settings, args.keepalive);
            apply_interface(&mut settings, args.interface);
            settings.require_backend_url()?;
            let device = app::open_interface(&settings)?;
            app::run_direct_host(&settings, device).await
        }
        Command::DirectPlayer(args) => {
            if args.backend.is_some() {
                settings.backend_url = args.backend;
            }
            if args.room.is_some() {
                settings.room = args.room;
            }
            apply_keepalive(&mut settings, args.keepalive);
            apply_interface(&mut settings, args.interface);
            settings.require_backend_url()?;
            let room = app::resolve_room(&settings)?;
            let device = app::open_interface(&settings)?;
            app::run_direct_player(&settings, room, device).await
        }
        Command::Backend(args) => {
            info!("Starting room backend");
            app::run_backend(args.bind).await
        }
    }
}

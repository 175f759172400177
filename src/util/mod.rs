use std::net::IpAddr;

use systemstat::{Platform, System};
use tracing::{debug, info};

pub mod stun;

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Tries the address of the default route first, then iterates over all
/// network interfaces provided by `systemstat`, skipping any loopback,
/// link-local or broadcast addresses.
pub fn select_host_address() -> Option<IpAddr> {
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(v)) if is_shareable(v) => return Some(IpAddr::V4(v)),
        Ok(ip) => debug!("Default route address {} is not shareable", ip),
        Err(e) => debug!("No default route address: {}", e),
    }

    let system = System::new();
    let networks = match system.networks() {
        Ok(networks) => networks,
        Err(e) => {
            info!("Failed to list network interfaces: {}", e);
            return None;
        }
    };

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if is_shareable(v) {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

fn is_shareable(v: std::net::Ipv4Addr) -> bool {
    !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() && !v.is_unspecified()
}

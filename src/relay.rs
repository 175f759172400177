//! Relay fallback server
//!
//! A blind UDP hub for peers that cannot connect directly: every datagram is
//! forwarded verbatim to every other client the relay has heard from, never
//! back to its sender. A client is known from its first datagram on.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_RELAY_PORT: u16 = 5001;

/// Large enough for any UDP payload, so nothing is ever truncated.
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone)]
pub struct ClientEndpoint {
    pub addr: SocketAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Instant,
}

/// Source endpoints seen so far, keyed by address.
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: HashMap<SocketAddr, ClientEndpoint>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a datagram from `addr`; true if the endpoint is new.
    pub fn observe(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.clients.get_mut(&addr) {
            Some(client) => {
                client.last_seen = now;
                false
            }
            None => {
                self.clients.insert(
                    addr,
                    ClientEndpoint {
                        addr,
                        first_seen: Utc::now(),
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Every known endpoint except `addr`.
    pub fn others(&self, addr: SocketAddr) -> Vec<SocketAddr> {
        self.clients.keys().filter(|a| **a != addr).copied().collect()
    }

    /// Forget endpoints silent for longer than `idle`.
    pub fn evict_idle(&mut self, now: Instant, idle: Duration) -> Vec<SocketAddr> {
        let expired: Vec<SocketAddr> = self
            .clients
            .values()
            .filter(|c| now.saturating_duration_since(c.last_seen) > idle)
            .map(|c| c.addr)
            .collect();
        for addr in &expired {
            self.clients.remove(addr);
        }
        expired
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&ClientEndpoint> {
        self.clients.get(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.clients.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Evict clients silent this long. Never evict when unset.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            idle_timeout: None,
        }
    }
}

pub struct RelayServer {
    socket: UdpSocket,
    table: ClientTable,
    idle_timeout: Option<Duration>,
    forwarded: u64,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> io::Result<RelayServer> {
        let socket = UdpSocket::bind(config.bind).await?;
        info!("Relay listening on {}", socket.local_addr()?);
        Ok(RelayServer {
            socket,
            table: ClientTable::new(),
            idle_timeout: config.idle_timeout,
            forwarded: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let sweep_every = self
            .idle_timeout
            .map(|idle| (idle / 2).max(Duration::from_millis(10)))
            .unwrap_or(Duration::from_secs(3600));
        let mut sweep = tokio::time::interval(sweep_every);

        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, source)) => self.forward(&buf[..n], source).await,
                    // ICMP errors from a vanished client surface here on some
                    // platforms.
                    Err(e) => debug!("Relay receive error: {}", e),
                },
                _ = sweep.tick(), if self.idle_timeout.is_some() => self.sweep(),
                _ = shutdown.changed() => break,
            }
        }
        info!(
            "Relay stopping: {} clients, {} datagrams forwarded",
            self.table.len(),
            self.forwarded
        );
        Ok(())
    }

    async fn forward(&mut self, packet: &[u8], source: SocketAddr) {
        if self.table.observe(source, Instant::now()) {
            info!("New relay client {} ({} total)", source, self.table.len());
        }
        for target in self.table.others(source) {
            match self.socket.send_to(packet, target).await {
                Ok(_) => self.forwarded += 1,
                Err(e) => warn!("Relay send to {} failed: {}", target, e),
            }
        }
    }

    fn sweep(&mut self) {
        let Some(idle) = self.idle_timeout else {
            return;
        };
        for addr in self.table.evict_idle(Instant::now(), idle) {
            info!("Evicted idle relay client {}", addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_observe_registers_once() {
        let mut table = ClientTable::new();
        let now = Instant::now();
        assert!(table.observe(addr(1), now));
        assert!(!table.observe(addr(1), now));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_others_excludes_sender() {
        let mut table = ClientTable::new();
        let now = Instant::now();
        for port in 1..=3 {
            table.observe(addr(port), now);
        }
        let mut others = table.others(addr(2));
        others.sort();
        assert_eq!(others, vec![addr(1), addr(3)]);
    }

    #[test]
    fn test_first_datagram_has_no_recipients() {
        let mut table = ClientTable::new();
        table.observe(addr(1), Instant::now());
        assert!(table.others(addr(1)).is_empty());
    }

    #[test]
    fn test_idle_clients_are_evicted() {
        let mut table = ClientTable::new();
        let start = Instant::now();
        table.observe(addr(1), start);
        table.observe(addr(2), start + Duration::from_secs(20));

        let evicted = table.evict_idle(start + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(evicted, vec![addr(1)]);
        assert!(table.contains(&addr(2)));
    }

    #[test]
    fn test_last_seen_is_refreshed() {
        let mut table = ClientTable::new();
        let start = Instant::now();
        table.observe(addr(1), start);
        table.observe(addr(1), start + Duration::from_secs(10));

        let client = table.get(&addr(1)).unwrap();
        assert_eq!(client.last_seen, start + Duration::from_secs(10));
        assert!(table
            .evict_idle(start + Duration::from_secs(35), Duration::from_secs(30))
            .is_empty());
    }
}

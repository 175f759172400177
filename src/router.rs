//! Packet router
//!
//! Moves Ethernet frames between the virtual interface and the sessions in
//! the registry. On the host every frame from one player is also re-fanned
//! to every other player, which makes the room one broadcast domain. A
//! player never re-fans.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::VirtualInterface;
use crate::error::SendError;
use crate::model::{LocalRole, PeerId};
use crate::registry::PeerRegistry;
use crate::MIN_FRAME_LEN;

/// Drop counters, read by the status log line and by tests.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub from_device: AtomicU64,
    pub to_device: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped_short: AtomicU64,
    pub dropped_oversize: AtomicU64,
    pub dropped_queue: AtomicU64,
}

impl RouterStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub struct Router {
    role: LocalRole,
    registry: Arc<PeerRegistry>,
    device: Arc<dyn VirtualInterface>,
    write_lock: Mutex<()>,
    max_frame: usize,
    stats: RouterStats,
}

impl Router {
    /// `mtu` bounds the payload; a frame may carry an Ethernet header on top.
    pub fn new(
        role: LocalRole,
        registry: Arc<PeerRegistry>,
        device: Arc<dyn VirtualInterface>,
        mtu: usize,
    ) -> Router {
        Router {
            role,
            registry,
            device,
            write_lock: Mutex::new(()),
            max_frame: mtu + MIN_FRAME_LEN,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn log_summary(&self) {
        let s = &self.stats;
        info!(
            "Frames: {} from {}, {} to it, {} forwarded, dropped {} short / {} oversize / {} on full queues",
            RouterStats::get(&s.from_device),
            self.device.name(),
            RouterStats::get(&s.to_device),
            RouterStats::get(&s.forwarded),
            RouterStats::get(&s.dropped_short),
            RouterStats::get(&s.dropped_oversize),
            RouterStats::get(&s.dropped_queue),
        );
    }

    fn admit(&self, frame: &[u8]) -> bool {
        if frame.len() < MIN_FRAME_LEN {
            RouterStats::bump(&self.stats.dropped_short);
            return false;
        }
        if frame.len() > self.max_frame {
            RouterStats::bump(&self.stats.dropped_oversize);
            debug!("Dropping oversize frame of {} bytes", frame.len());
            return false;
        }
        true
    }

    /// A frame arrived on the session with `origin`.
    pub fn on_session_frame(&self, origin: &PeerId, frame: &[u8]) {
        if !self.admit(frame) {
            return;
        }
        self.write_to_device(frame);
        if self.role.is_hub() {
            self.fan_out(frame, Some(origin));
        }
    }

    /// A frame was read from the local interface.
    pub fn on_device_frame(&self, frame: &[u8]) {
        if !self.admit(frame) {
            return;
        }
        RouterStats::bump(&self.stats.from_device);
        self.fan_out(frame, None);
    }

    /// Queue `frame` on every Open session except `except`. Returns how many
    /// sessions accepted it.
    pub fn fan_out(&self, frame: &[u8], except: Option<&PeerId>) -> usize {
        let mut accepted = 0;
        self.registry
            .for_each_open(except.map(|p| &**p), |handle| {
                match handle.send_frame(frame) {
                    Ok(()) => {
                        accepted += 1;
                        RouterStats::bump(&self.stats.forwarded);
                    }
                    Err(SendError::Full) => {
                        RouterStats::bump(&self.stats.dropped_queue);
                        debug!("Queue to {} is full, dropping frame", handle.peer_id());
                    }
                    Err(e) => debug!("Not sending to {}: {}", handle.peer_id(), e),
                }
            });
        accepted
    }

    fn write_to_device(&self, frame: &[u8]) {
        let _guard = self.write_lock.lock();
        match self.device.write(frame) {
            Ok(_) => RouterStats::bump(&self.stats.to_device),
            Err(e) => warn!("Failed to write frame to {}: {}", self.device.name(), e),
        }
    }

    /// Pump frames from the interface until it is closed.
    pub fn spawn_device_reader(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        let router = self.clone();
        thread::Builder::new()
            .name(format!("{}-reader", self.device.name()))
            .spawn(move || router.pump_device())
    }

    fn pump_device(&self) {
        let mut buf = vec![0u8; self.max_frame + 1];
        info!("Reading frames from {}", self.device.name());
        loop {
            match self.device.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.on_device_frame(&buf[..n]),
                Err(e) if e.is_terminal() => {
                    info!("Stopped reading from {}: {}", self.device.name(), e);
                    break;
                }
                Err(e) => warn!("Read from {} failed: {}", self.device.name(), e),
            }
        }
    }
}

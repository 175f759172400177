//! Virtual network interface
//!
//! The OS-facing end of the tunnel: raw Ethernet frames read from and
//! written to an interface the game binds to. Reads block, so the router
//! pumps them from a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::error::DeviceError;

#[cfg(target_os = "linux")]
pub mod tap;

pub trait VirtualInterface: Send + Sync {
    fn name(&self) -> &str;

    /// Block until one frame is available and copy it into `buf`.
    fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    fn write(&self, frame: &[u8]) -> Result<usize, DeviceError>;

    /// Unblock pending reads; every later call fails with `Closed`.
    fn close(&self);
}

/// In-process interface. Frames injected with [`MemoryInterface::inject`]
/// come out of `read`, frames written by the router are kept for inspection.
pub struct MemoryInterface {
    name: String,
    inbound_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryInterface {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel();
        MemoryInterface {
            name: name.into(),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Hand a frame to the interface as if the local OS had sent it.
    pub fn inject(&self, frame: &[u8]) -> Result<(), DeviceError> {
        match self.inbound_tx.lock().as_ref() {
            Some(tx) => tx
                .send(frame.to_vec())
                .map_err(|_| DeviceError::Closed(self.name.clone())),
            None => Err(DeviceError::Closed(self.name.clone())),
        }
    }

    /// Frames delivered to the local OS so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let frame = self
            .inbound_rx
            .lock()
            .recv()
            .map_err(|_| DeviceError::Closed(self.name.clone()))?;
        if self.is_closed() {
            return Err(DeviceError::Closed(self.name.clone()));
        }
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    fn write(&self, frame: &[u8]) -> Result<usize, DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed(self.name.clone()));
        }
        self.written.lock().push(frame.to_vec());
        Ok(frame.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inbound_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_memory_interface_reads_injected_frames_in_order() {
        let dev = MemoryInterface::new("mem0");
        dev.inject(b"first").unwrap();
        dev.inject(b"second").unwrap();

        let mut buf = [0u8; 64];
        let n = dev.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = dev.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn test_close_unblocks_a_pending_read() {
        let dev = Arc::new(MemoryInterface::new("mem0"));
        let reader = {
            let dev = dev.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 64];
                dev.read(&mut buf)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        dev.close();

        let res = reader.join().unwrap();
        assert!(matches!(res, Err(DeviceError::Closed(_))));
        assert!(dev.write(b"late").is_err());
        assert!(dev.inject(b"late").is_err());
    }
}

//! Linux TAP device attached through `/dev/net/tun`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use super::VirtualInterface;
use crate::error::DeviceError;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// How long a read waits before rechecking whether the device was closed.
const POLL_INTERVAL_MS: libc::c_int = 200;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TapDevice {
    name: String,
    file: File,
    closed: AtomicBool,
}

impl TapDevice {
    /// Attach to (or create, with CAP_NET_ADMIN) the TAP interface `name`.
    /// Frames are exchanged without the packet-info prefix.
    pub fn attach(name: &str) -> Result<TapDevice, DeviceError> {
        let open_err = |source| DeviceError::Open {
            name: name.to_string(),
            source,
        };
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(open_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name must be 1 to 15 bytes",
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(open_err)?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }

        // SAFETY: `req` is a properly sized ifreq that outlives the call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        let attached: String = req
            .name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8 as char)
            .collect();
        info!("Attached to TAP device {}", attached);

        Ok(TapDevice {
            name: attached,
            file,
            closed: AtomicBool::new(false),
        })
    }

    fn closed_err(&self) -> DeviceError {
        DeviceError::Closed(self.name.clone())
    }

    /// Wait until the fd is readable. `false` on timeout.
    fn wait_readable(&self) -> Result<bool, DeviceError> {
        let mut fds = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut fds, 1, POLL_INTERVAL_MS) };
        match rc {
            0 => Ok(false),
            n if n > 0 => {
                if hung_up(fds.revents) {
                    Err(self.closed_err())
                } else {
                    Ok(true)
                }
            }
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(classify(&self.name, err))
                }
            }
        }
    }
}

/// Poll flags reported once the interface is gone.
fn hung_up(revents: libc::c_short) -> bool {
    revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
}

/// The tun driver answers with EBADFD once the interface is deleted and
/// ENODEV when it was brought down underneath us.
fn classify(name: &str, err: io::Error) -> DeviceError {
    match err.raw_os_error() {
        Some(libc::EBADFD) | Some(libc::ENODEV) | Some(libc::EBADF) => {
            DeviceError::Closed(name.to_string())
        }
        _ => DeviceError::Io(err),
    }
}

impl VirtualInterface for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(self.closed_err());
            }
            if !self.wait_readable()? {
                continue;
            }
            match (&self.file).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify(&self.name, e)),
            }
        }
    }

    fn write(&self, frame: &[u8]) -> Result<usize, DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_err());
        }
        (&self.file)
            .write(frame)
            .map_err(|e| classify(&self.name, e))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closing TAP device {}", self.name);
        }
    }
}

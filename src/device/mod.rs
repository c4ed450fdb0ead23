//! Virtual-interface boundary.
//!
//! The host establishes the tun (allowed applications, routes) and hands the
//! engine a readable and a writable frame handle. The engine never creates
//! or tears down the interface; it reads until the handle reports an error
//! and writes only frames it constructed itself.
//!
//! Two backings exist: [`FdTun`] over a raw file descriptor (Android
//! `VpnService`, Linux `/dev/net/tun`, macOS `utun`) and [`MemoryTun`], a
//! channel pair the embedding code or tests push frames through.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rustc_hash::FxHashSet;
use std::ffi::c_void;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::logger::{self, BreadcrumbFlags};

/// Length of the address-family prefix `utun` puts in front of every frame.
pub const PACKET_INFO_LEN: usize = 4;

/// Source of complete raw IP frames.
pub trait FrameReader: Send {
    /// Waits up to `timeout` for one frame and copies it into `buf`.
    ///
    /// `Ok(None)` means nothing arrived in time. Any `Err` means the
    /// interface is gone and the caller should stop reading.
    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// Sink for complete raw IP frames.
pub trait FrameWriter: Send {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Application identifiers the host allowed through the tun.
#[derive(Clone, Debug, Default)]
pub struct AllowedAppSet {
    apps: FxHashSet<String>,
}

impl AllowedAppSet {
    pub fn new<I, S>(apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            apps: apps
                .into_iter()
                .map(Into::into)
                .filter(|app: &String| !app.trim().is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, app: &str) -> bool {
        self.apps.contains(app)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Stable ordering for events and logs.
    pub fn sorted(&self) -> Vec<String> {
        let mut apps: Vec<String> = self.apps.iter().cloned().collect();
        apps.sort_unstable();
        apps
    }
}

/// The pair of handles the interception loop runs on.
pub struct TunDevice {
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
    allowed_apps: AllowedAppSet,
}

impl TunDevice {
    pub fn new(reader: Box<dyn FrameReader>, writer: Box<dyn FrameWriter>) -> Self {
        Self {
            reader,
            writer,
            allowed_apps: AllowedAppSet::default(),
        }
    }

    /// Wraps a host-owned tun descriptor. The descriptor is duplicated, so
    /// the host keeps ownership of `fd` and must close it itself.
    pub fn from_fd(fd: RawFd, packet_info: bool) -> io::Result<Self> {
        let (reader, writer) = FdTun::duplicate(fd, packet_info)?.split();
        Ok(Self::new(Box::new(reader), Box::new(writer)))
    }

    pub fn memory() -> (Self, TunHandle) {
        let (reader, writer, handle) = MemoryTun::channel();
        (Self::new(Box::new(reader), Box::new(writer)), handle)
    }

    pub fn with_allowed_apps(mut self, allowed_apps: AllowedAppSet) -> Self {
        self.allowed_apps = allowed_apps;
        self
    }

    pub fn allowed_apps(&self) -> &AllowedAppSet {
        &self.allowed_apps
    }

    pub fn into_parts(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>, AllowedAppSet) {
        (self.reader, self.writer, self.allowed_apps)
    }
}

// ============================================================================
// File-descriptor backing
// ============================================================================

pub struct FdTun {
    fd: Arc<OwnedFd>,
    packet_info: bool,
}

impl FdTun {
    pub fn duplicate(fd: RawFd, packet_info: bool) -> io::Result<Self> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tun descriptor is negative",
            ));
        }
        // Safety: the caller guarantees `fd` is open for the duration of this call.
        let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            format!(
                "tun fd {fd} duplicated as {} (packet_info={packet_info})",
                owned.as_raw_fd()
            ),
        );
        Ok(Self {
            fd: Arc::new(owned),
            packet_info,
        })
    }

    pub fn split(self) -> (FdReader, FdWriter) {
        (
            FdReader {
                fd: Arc::clone(&self.fd),
                packet_info: self.packet_info,
            },
            FdWriter {
                fd: self.fd,
                packet_info: self.packet_info,
            },
        )
    }
}

pub struct FdReader {
    fd: Arc<OwnedFd>,
    packet_info: bool,
}

pub struct FdWriter {
    fd: Arc<OwnedFd>,
    packet_info: bool,
}

impl FdReader {
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Ok(false);
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
            && pollfd.revents & libc::POLLIN == 0
        {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tun descriptor hung up",
            ));
        }
        Ok(true)
    }
}

impl FrameReader for FdReader {
    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }
        let mut header = [0u8; PACKET_INFO_LEN];
        let mut iov = [
            libc::iovec {
                iov_base: header.as_mut_ptr() as *mut c_void,
                iov_len: PACKET_INFO_LEN,
            },
            libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut c_void,
                iov_len: buf.len(),
            },
        ];
        let (first, count) = if self.packet_info { (0, 2) } else { (1, 1) };
        let read = unsafe { libc::readv(self.fd.as_raw_fd(), iov[first..].as_mut_ptr(), count) };
        if read < 0 {
            let error = io::Error::last_os_error();
            return match error.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(error),
            };
        }
        let read = read as usize;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tun descriptor closed",
            ));
        }
        if !self.packet_info {
            return Ok(Some(read));
        }
        if read <= PACKET_INFO_LEN {
            return Ok(None);
        }
        Ok(Some(read - PACKET_INFO_LEN))
    }
}

impl FrameWriter for FdWriter {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let header = address_family(frame).to_be_bytes();
        let iov = [
            libc::iovec {
                iov_base: header.as_ptr() as *mut c_void,
                iov_len: PACKET_INFO_LEN,
            },
            libc::iovec {
                iov_base: frame.as_ptr() as *mut c_void,
                iov_len: frame.len(),
            },
        ];
        let (first, count, expected) = if self.packet_info {
            (0, 2, frame.len() + PACKET_INFO_LEN)
        } else {
            (1, 1, frame.len())
        };
        loop {
            let written = unsafe { libc::writev(self.fd.as_raw_fd(), iov[first..].as_ptr(), count) };
            if written < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(error);
            }
            // A tun write is all-or-nothing per frame.
            if written as usize != expected {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short tun write: {written} of {expected} bytes"),
                ));
            }
            return Ok(());
        }
    }
}

fn address_family(frame: &[u8]) -> u32 {
    match frame.first().map(|byte| byte >> 4) {
        Some(6) => libc::AF_INET6 as u32,
        _ => libc::AF_INET as u32,
    }
}

// ============================================================================
// Channel backing
// ============================================================================

pub struct MemoryTun;

impl MemoryTun {
    pub fn channel() -> (MemoryReader, MemoryWriter, TunHandle) {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        (
            MemoryReader { inbound: inbound_rx },
            MemoryWriter {
                outbound: outbound_tx,
            },
            TunHandle {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

pub struct MemoryReader {
    inbound: Receiver<Vec<u8>>,
}

pub struct MemoryWriter {
    outbound: Sender<Vec<u8>>,
}

/// The host side of a [`MemoryTun`]: frames injected here are read by the
/// engine, frames the engine writes come out of [`TunHandle::recv_written`].
/// Dropping the handle (or calling [`TunHandle::close`]) looks like the
/// interface going away.
pub struct TunHandle {
    inbound: Sender<Vec<u8>>,
    outbound: Receiver<Vec<u8>>,
}

impl TunHandle {
    /// Returns `false` once the engine side is gone.
    pub fn inject(&self, frame: &[u8]) -> bool {
        if frame.is_empty() {
            return true;
        }
        self.inbound.send(frame.to_vec()).is_ok()
    }

    pub fn recv_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.outbound.recv_timeout(timeout).ok()
    }

    pub fn drain_written(&self) -> Vec<Vec<u8>> {
        self.outbound.try_iter().collect()
    }

    pub fn close(self) {}
}

impl FrameReader for MemoryReader {
    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => {
                // Oversized frames are truncated like a short read(2) would.
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "memory tun closed",
            )),
        }
    }
}

impl FrameWriter for MemoryWriter {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory tun closed"))
    }
}

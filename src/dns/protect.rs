//! Keeps the engine's own upstream sockets out of the tunnel.
//!
//! The tun routes capture every packet of the allowed applications. If the
//! engine itself is captured, its forwarded queries arrive back on the tun
//! and get forwarded again. Each upstream socket is therefore handed to a
//! [`SocketProtector`] before anything is sent on it (`VpnService.protect`
//! on Android). A protector that returns `false` aborts the exchange.

use std::ffi::{c_int, c_void};
use std::os::fd::RawFd;

pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}

/// For hosts whose routing already excludes the engine, e.g. the standalone
/// runner where only selected routes point at the tun.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtection;

impl SocketProtector for NoProtection {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

impl<F> SocketProtector for F
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> bool {
        self(fd)
    }
}

pub type ProtectSocketFn = unsafe extern "C" fn(fd: c_int, context: *mut c_void) -> bool;

/// Protector backed by a host C callback, e.g. a JNI shim that calls
/// `VpnService.protect(fd)`.
#[derive(Clone, Copy)]
pub struct CallbackProtector {
    callback: ProtectSocketFn,
    context: *mut c_void,
}

// The host promises the callback may be invoked from any runtime worker.
unsafe impl Send for CallbackProtector {}
unsafe impl Sync for CallbackProtector {}

impl CallbackProtector {
    /// # Safety
    /// `callback` must stay callable with `context` for as long as the engine
    /// runs, from any thread.
    pub unsafe fn new(callback: ProtectSocketFn, context: *mut c_void) -> Self {
        Self { callback, context }
    }
}

impl SocketProtector for CallbackProtector {
    fn protect(&self, fd: RawFd) -> bool {
        unsafe { (self.callback)(fd, self.context) }
    }
}

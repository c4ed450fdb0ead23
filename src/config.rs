//! Engine settings and their clamping rules.

use crate::packet::MIN_HEADER_LEN;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// AdGuard DNS, the resolver the tunnel has always shipped with.
pub const DEFAULT_UPSTREAM_V4: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(94, 140, 14, 14), 53);
pub const DEFAULT_UPSTREAM: SocketAddr = SocketAddr::V4(DEFAULT_UPSTREAM_V4);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_READ_BUFFER: usize = 32 * 1024 - 1;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 9000;
const MIN_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_READ_BUFFER: usize = 2048;
const MAX_READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub upstream: SocketAddr,
    pub timeout: Duration,
    pub mtu: usize,
    pub read_buffer_size: usize,
    pub max_in_flight: usize,
    /// Linux/Android: pin upstream sockets to this interface (`SO_BINDTODEVICE`).
    pub bind_interface: Option<String>,
    /// Frames carry a 4-byte address family prefix (macOS utun).
    pub packet_info: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upstream: DEFAULT_UPSTREAM,
            timeout: DEFAULT_TIMEOUT,
            mtu: DEFAULT_MTU,
            read_buffer_size: DEFAULT_READ_BUFFER,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            bind_interface: None,
            packet_info: false,
        }
    }
}

impl EngineConfig {
    /// Clamps every field into its supported range.
    pub fn normalized(mut self) -> Self {
        self.timeout = self.timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self.mtu = self.mtu.clamp(MIN_MTU, MAX_MTU);
        self.read_buffer_size = self
            .read_buffer_size
            .clamp(MIN_READ_BUFFER, MAX_READ_BUFFER)
            .max(self.mtu);
        self.max_in_flight = self.max_in_flight.max(1);
        if self
            .bind_interface
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            self.bind_interface = None;
        }
        self
    }

    /// Largest DNS answer that still fits in one frame on the tun path.
    pub fn max_answer_len(&self) -> usize {
        self.mtu.saturating_sub(MIN_HEADER_LEN)
    }
}

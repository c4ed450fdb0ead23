use std::ffi::{c_char, c_void, CStr};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, EngineConfig};
use crate::dns::protect::ProtectSocketFn;
use crate::dns::{CallbackProtector, NoProtection, SocketProtector};
use crate::telemetry::{CounterSnapshot, TelemetryEvent};

pub const SNIFFLE_OK: i32 = 0;
pub const SNIFFLE_ERR_NULL_ENGINE: i32 = -1;
pub const SNIFFLE_ERR_BAD_DEVICE: i32 = -2;
pub const SNIFFLE_ERR_ALREADY_RUNNING: i32 = -3;
pub const SNIFFLE_ERR_START_FAILED: i32 = -4;

pub const SNIFFLE_TELEMETRY_MAX_QNAME: usize = 256;

/// Mirror of the `SniffleConfig` struct in `include/sniffle.h`. Zero fields
/// select the engine default.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct SniffleConfig {
    /// Upstream IPv4 address in network order.
    pub upstream_addr: [u8; 4],
    pub upstream_port: u16,
    pub timeout_ms: u32,
    pub mtu: u32,
    pub read_buffer_size: u32,
    pub max_in_flight: u32,
    /// Non-zero when tun frames carry a 4-byte address family prefix.
    pub packet_info: u8,
    /// Optional NUL-terminated interface name for `SO_BINDTODEVICE`.
    pub bind_interface: *const c_char,
}

impl Default for SniffleConfig {
    fn default() -> Self {
        let upstream = config::DEFAULT_UPSTREAM_V4;
        Self {
            upstream_addr: upstream.ip().octets(),
            upstream_port: upstream.port(),
            timeout_ms: config::DEFAULT_TIMEOUT.as_millis() as u32,
            mtu: config::DEFAULT_MTU as u32,
            read_buffer_size: config::DEFAULT_READ_BUFFER as u32,
            max_in_flight: config::DEFAULT_MAX_IN_FLIGHT as u32,
            packet_info: 0,
            bind_interface: std::ptr::null(),
        }
    }
}

impl SniffleConfig {
    /// # Safety
    /// `bind_interface` must be null or point to a NUL-terminated string.
    pub unsafe fn to_engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let upstream = if self.upstream_addr == [0; 4] {
            defaults.upstream
        } else {
            let port = if self.upstream_port == 0 {
                53
            } else {
                self.upstream_port
            };
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.upstream_addr), port))
        };
        let bind_interface = if self.bind_interface.is_null() {
            None
        } else {
            unsafe { CStr::from_ptr(self.bind_interface) }
                .to_str()
                .ok()
                .map(str::to_owned)
        };
        EngineConfig {
            upstream,
            timeout: nonzero(self.timeout_ms)
                .map(|ms| Duration::from_millis(u64::from(ms)))
                .unwrap_or(defaults.timeout),
            mtu: nonzero(self.mtu).map_or(defaults.mtu, |v| v as usize),
            read_buffer_size: nonzero(self.read_buffer_size)
                .map_or(defaults.read_buffer_size, |v| v as usize),
            max_in_flight: nonzero(self.max_in_flight).map_or(defaults.max_in_flight, |v| v as usize),
            bind_interface,
            packet_info: self.packet_info != 0,
        }
        .normalized()
    }
}

fn nonzero(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

/// Callbacks installed by the host when the engine starts.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SniffleCallbacks {
    /// Exempts an upstream socket from the tun (`VpnService.protect`).
    /// Null when the host routes exclude the engine already.
    pub protect_socket: Option<ProtectSocketFn>,
    pub context: *mut c_void,
}

impl Default for SniffleCallbacks {
    fn default() -> Self {
        Self {
            protect_socket: None,
            context: std::ptr::null_mut(),
        }
    }
}

impl SniffleCallbacks {
    /// # Safety
    /// `protect_socket` must remain callable with `context` from any thread
    /// until the engine is stopped.
    pub unsafe fn protector(&self) -> Arc<dyn SocketProtector> {
        match self.protect_socket {
            Some(callback) => Arc::new(unsafe { CallbackProtector::new(callback, self.context) }),
            None => Arc::new(NoProtection),
        }
    }
}

#[repr(C)]
pub struct SniffleLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SniffleCounters {
    pub frames_read: u64,
    pub dns_candidates: u64,
    pub queries_forwarded: u64,
    pub responses_written: u64,
    pub forward_failures: u64,
    pub parse_failures: u64,
}

impl From<CounterSnapshot> for SniffleCounters {
    fn from(snapshot: CounterSnapshot) -> Self {
        Self {
            frames_read: snapshot.frames_read,
            dns_candidates: snapshot.dns_candidates,
            queries_forwarded: snapshot.queries_forwarded,
            responses_written: snapshot.responses_written,
            forward_failures: snapshot.forward_failures,
            parse_failures: snapshot.parse_failures,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SniffleTelemetryEvent {
    pub timestamp_ms: u64,
    /// `EventKind` discriminant.
    pub kind: u8,
    /// `FailureReason` discriminant.
    pub reason: u8,
    /// All zero when the event has no client.
    pub src_ip: [u8; 4],
    pub src_port: u16,
    /// Zero when unknown.
    pub qtype: u16,
    pub payload_len: u32,
    pub allowed_app_count: u32,
    pub qname_len: u16,
    pub qname: [c_char; SNIFFLE_TELEMETRY_MAX_QNAME],
}

impl Default for SniffleTelemetryEvent {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            kind: 0,
            reason: 0,
            src_ip: [0; 4],
            src_port: 0,
            qtype: 0,
            payload_len: 0,
            allowed_app_count: 0,
            qname_len: 0,
            qname: [0; SNIFFLE_TELEMETRY_MAX_QNAME],
        }
    }
}

impl From<&TelemetryEvent> for SniffleTelemetryEvent {
    fn from(event: &TelemetryEvent) -> Self {
        let mut out = Self {
            timestamp_ms: event.timestamp_ms,
            kind: event.kind as u8,
            reason: event.reason as u8,
            src_ip: event.src.map(|ip| ip.octets()).unwrap_or_default(),
            src_port: event.src_port,
            qtype: event.qtype.unwrap_or(0),
            payload_len: event.payload_len,
            allowed_app_count: u32::try_from(event.allowed_apps.len()).unwrap_or(u32::MAX),
            ..Self::default()
        };
        if let Some(qname) = &event.qname {
            // Keep room for the terminating NUL.
            let len = qname.len().min(SNIFFLE_TELEMETRY_MAX_QNAME - 1);
            for (slot, byte) in out.qname.iter_mut().zip(&qname.as_bytes()[..len]) {
                *slot = *byte as c_char;
            }
            out.qname_len = len as u16;
        }
        out
    }
}

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::logger::{self, BreadcrumbFlags};

const MAX_EVENTS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    InterfaceStarted = 0,
    InterfaceStopped = 1,
    QueryObserved = 2,
    ForwardFailed = 3,
    ParseFailed = 4,
    ResponseWritten = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FailureReason {
    None = 0,
    Timeout = 1,
    Network = 2,
    Unprotected = 3,
    IdMismatch = 4,
    Busy = 5,
    MalformedQuery = 6,
    Rewrite = 7,
}

impl From<&crate::dns::ForwardError> for FailureReason {
    fn from(error: &crate::dns::ForwardError) -> Self {
        use crate::dns::ForwardError;
        match error {
            ForwardError::Timeout { .. } => Self::Timeout,
            ForwardError::Network { .. } => Self::Network,
            ForwardError::Unprotected(_) => Self::Unprotected,
            ForwardError::IdMismatch { .. } => Self::IdMismatch,
            ForwardError::MalformedRequest(_) => Self::MalformedQuery,
            ForwardError::Busy => Self::Busy,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TelemetryEvent {
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub src: Option<Ipv4Addr>,
    pub src_port: u16,
    pub qname: Option<String>,
    pub qtype: Option<u16>,
    pub reason: FailureReason,
    pub payload_len: u32,
    /// Only set on `InterfaceStarted`.
    pub allowed_apps: Vec<String>,
}

impl TelemetryEvent {
    pub fn new(kind: EventKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            kind,
            src: None,
            src_port: 0,
            qname: None,
            qtype: None,
            reason: FailureReason::None,
            payload_len: 0,
            allowed_apps: Vec::new(),
        }
    }

    pub fn from_client(mut self, src: Ipv4Addr, src_port: u16) -> Self {
        self.src = Some(src);
        self.src_port = src_port;
        self
    }

    pub fn with_query(mut self, qname: &str, qtype: Option<u16>) -> Self {
        self.qname = Some(qname.to_owned());
        self.qtype = qtype;
        self
    }

    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = u32::try_from(len).unwrap_or(u32::MAX);
        self
    }
}

#[derive(Default)]
struct TelemetryInner {
    events: VecDeque<TelemetryEvent>,
    dropped: u64,
}

#[derive(Default)]
pub struct Telemetry {
    inner: Mutex<TelemetryInner>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TelemetryInner {
                events: VecDeque::with_capacity(MAX_EVENTS),
                dropped: 0,
            }),
        }
    }

    pub fn record(&self, event: TelemetryEvent) {
        let mut guard = self.inner.lock();
        if guard.events.len() >= MAX_EVENTS {
            guard.events.pop_front();
            guard.dropped = guard.dropped.saturating_add(1);
            logger::breadcrumb(
                BreadcrumbFlags::DNS,
                "telemetry backlog saturated, dropping oldest event",
            );
        }
        guard.events.push_back(event);
    }

    /// Returns up to `max_events` of the oldest events plus the number of
    /// events discarded since the previous drain.
    pub fn drain(&self, max_events: usize) -> (Vec<TelemetryEvent>, u64) {
        let mut guard = self.inner.lock();
        let take = max_events.min(guard.events.len());
        let drained: Vec<TelemetryEvent> = guard.events.drain(..take).collect();
        let dropped = std::mem::take(&mut guard.dropped);
        (drained, dropped)
    }
}

/// Running totals shared by the reader, the forwarding tasks and the writer.
#[derive(Default, Debug)]
pub struct EngineCounters {
    pub frames_read: AtomicU64,
    pub dns_candidates: AtomicU64,
    pub queries_forwarded: AtomicU64,
    pub responses_written: AtomicU64,
    pub forward_failures: AtomicU64,
    pub parse_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub frames_read: u64,
    pub dns_candidates: u64,
    pub queries_forwarded: u64,
    pub responses_written: u64,
    pub forward_failures: u64,
    pub parse_failures: u64,
}

impl EngineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            dns_candidates: self.dns_candidates.load(Ordering::Relaxed),
            queries_forwarded: self.queries_forwarded.load(Ordering::Relaxed),
            responses_written: self.responses_written.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
        }
    }
}

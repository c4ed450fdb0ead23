use super::*;
use crate::dns::testing::StubUpstream;
use crate::packet::testing::{dns_answer, query_frame};
use crate::packet::ParsedHeader;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

fn engine(upstream: SocketAddr) -> SniffleEngine {
    SniffleEngine::new(EngineConfig {
        upstream,
        timeout: Duration::from_millis(500),
        ..EngineConfig::default()
    })
    .unwrap()
}

fn wait_for_state(engine: &SniffleEngine, state: LifecycleState) -> bool {
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(2) {
        if engine.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn second_start_is_rejected_while_running() {
    let upstream = StubUpstream::silent();
    let engine = engine(upstream.addr());
    let (device, _handle) = TunDevice::memory();
    engine.start(device, Arc::new(NoProtection)).unwrap();
    assert_eq!(engine.state(), LifecycleState::Running);

    let (again, _other) = TunDevice::memory();
    let error = engine.start(again, Arc::new(NoProtection)).unwrap_err();
    assert!(matches!(error, EngineError::AlreadyRunning(LifecycleState::Running)));

    engine.stop();
    assert_eq!(engine.state(), LifecycleState::Stopped);
}

#[test]
fn engine_restarts_after_stop_and_after_interface_loss() {
    let upstream = StubUpstream::answering(|query| dns_answer(query, Ipv4Addr::LOCALHOST));
    let engine = engine(upstream.addr());

    let (device, handle) = TunDevice::memory();
    engine.start(device, Arc::new(NoProtection)).unwrap();
    engine.stop();

    let (device, handle_two) = TunDevice::memory();
    engine.start(device, Arc::new(NoProtection)).unwrap();
    handle_two.close();
    assert!(wait_for_state(&engine, LifecycleState::Stopped));

    let (device, handle_three) = TunDevice::memory();
    engine.start(device, Arc::new(NoProtection)).unwrap();
    handle_three.inject(&query_frame(9, "again.example"));
    assert!(handle_three.recv_written(Duration::from_secs(2)).is_some());
    drop(handle);
}

#[test]
fn lifecycle_events_carry_allowed_apps() {
    let upstream = StubUpstream::silent();
    let engine = engine(upstream.addr());
    let (device, _handle) = TunDevice::memory();
    let device = device.with_allowed_apps(AllowedAppSet::new(["org.example.mail", "org.example.browser"]));
    engine.start(device, Arc::new(NoProtection)).unwrap();
    engine.stop();

    let (events, dropped) = engine.drain_telemetry(16);
    assert_eq!(dropped, 0);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::InterfaceStarted);
    assert_eq!(
        events[0].allowed_apps,
        ["org.example.browser", "org.example.mail"]
    );
    assert_eq!(events[1].kind, EventKind::InterfaceStopped);
}

#[test]
fn ffi_rejects_null_and_bad_handles() {
    unsafe {
        assert_eq!(SniffleEngineState(std::ptr::null_mut()), SNIFFLE_ERR_NULL_ENGINE);
        assert_eq!(
            SniffleEngineStart(std::ptr::null_mut(), 0, std::ptr::null(), std::ptr::null(), 0),
            SNIFFLE_ERR_NULL_ENGINE
        );
        let engine = SniffleNewEngine(std::ptr::null());
        assert!(!engine.is_null());
        assert_eq!(
            SniffleEngineStart(engine, -1, std::ptr::null(), std::ptr::null(), 0),
            SNIFFLE_ERR_BAD_DEVICE
        );
        assert_eq!(SniffleEngineState(engine), LifecycleState::Stopped as i32);
        assert!(!SniffleEngineGetCounters(engine, std::ptr::null_mut()));
        SniffleFreeEngine(engine);
    }
}

#[test]
fn ffi_round_trip_over_a_descriptor() {
    let upstream = StubUpstream::answering(|query| dns_answer(query, Ipv4Addr::new(192, 0, 2, 7)));
    let SocketAddr::V4(upstream_v4) = upstream.addr() else {
        panic!("stub binds IPv4");
    };

    let mut fds = [0 as c_int; 2];
    let status =
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) };
    assert_eq!(status, 0);
    let (engine_side, host_side) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let config = SniffleConfig {
        upstream_addr: upstream_v4.ip().octets(),
        upstream_port: upstream_v4.port(),
        ..SniffleConfig::default()
    };
    let app = std::ffi::CString::new("org.example.browser").unwrap();
    let apps = [app.as_ptr()];
    unsafe {
        let engine = SniffleNewEngine(&config);
        assert_eq!(
            SniffleEngineStart(engine, engine_side.as_raw_fd(), std::ptr::null(), apps.as_ptr(), 1),
            SNIFFLE_OK
        );
        assert_eq!(
            SniffleEngineStart(engine, engine_side.as_raw_fd(), std::ptr::null(), apps.as_ptr(), 1),
            SNIFFLE_ERR_ALREADY_RUNNING
        );

        let frame = query_frame(0x0707, "ffi.example");
        let sent = libc::send(host_side.as_raw_fd(), frame.as_ptr().cast(), frame.len(), 0);
        assert_eq!(sent as usize, frame.len());

        let mut pollfd = libc::pollfd {
            fd: host_side.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        assert_eq!(libc::poll(&mut pollfd, 1, 2000), 1, "no reply on the tun");
        let mut reply = vec![0u8; 2048];
        let len = libc::recv(host_side.as_raw_fd(), reply.as_mut_ptr().cast(), reply.len(), 0);
        assert!(len > 0);
        reply.truncate(len as usize);
        let header = ParsedHeader::parse(&reply).unwrap();
        assert_eq!(header.src_port, 53);
        assert!(reply.ends_with(&[192, 0, 2, 7]));

        SniffleEngineStop(engine);
        assert_eq!(SniffleEngineState(engine), LifecycleState::Stopped as i32);

        let mut counters = SniffleCounters::default();
        assert!(SniffleEngineGetCounters(engine, &mut counters));
        assert_eq!(counters.frames_read, 1);
        assert_eq!(counters.responses_written, 1);

        let mut events = [SniffleTelemetryEvent::default(); 8];
        let mut dropped = u64::MAX;
        let count = SniffleTelemetryDrain(engine, events.as_mut_ptr(), events.len(), &mut dropped);
        assert_eq!(dropped, 0);
        let kinds: Vec<u8> = events[..count].iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            [
                EventKind::InterfaceStarted as u8,
                EventKind::QueryObserved as u8,
                EventKind::ResponseWritten as u8,
                EventKind::InterfaceStopped as u8,
            ]
        );
        assert_eq!(events[0].allowed_app_count, 1);
        SniffleFreeEngine(engine);
    }
    // The host's descriptor survives the engine.
    assert!(unsafe { libc::fcntl(engine_side.as_raw_fd(), libc::F_GETFD) } >= 0);
}

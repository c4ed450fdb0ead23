use libc::{self, c_char, c_void};
use sniffle_engine::ffi::{
    SniffleConfig, SniffleLogSink, SniffleTelemetryEvent, SNIFFLE_OK,
};
use sniffle_engine::packet::qtype_label;
use sniffle_engine::telemetry::EventKind;
use sniffle_engine::{
    LifecycleState, SniffleEngineStart, SniffleEngineState, SniffleEngineStop, SniffleFreeEngine,
    SniffleNewEngine, SniffleSetBreadcrumbMask, SniffleSetLogSink, SniffleTelemetryDrain,
};
use std::env;
use std::ffi::{CStr, CString};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::thread;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    eprintln!(
        "[standalone] launching sniffle engine (upstream={}, timeout={}ms, mtu={})",
        settings.upstream, settings.timeout_ms, settings.mtu
    );

    let tun = TunInterface::open(settings.tun.as_deref())?;
    println!(
        "[standalone] created interface {}. Configure it (as root), e.g.:\n  {}\nthen route the resolver address you want intercepted through it.",
        tun.name(),
        tun.setup_hint()
    );

    install_log_sink(settings.verbose);

    let bind_interface = settings
        .bind_interface
        .as_deref()
        .map(CString::new)
        .transpose()?;
    let config = SniffleConfig {
        upstream_addr: settings.upstream.ip().octets(),
        upstream_port: settings.upstream.port(),
        timeout_ms: settings.timeout_ms,
        mtu: settings.mtu,
        packet_info: u8::from(tun.packet_info()),
        bind_interface: bind_interface
            .as_ref()
            .map_or(ptr::null(), |name| name.as_ptr()),
        ..SniffleConfig::default()
    };
    let engine = unsafe { SniffleNewEngine(&config) };
    if engine.is_null() {
        anyhow::bail!("SniffleNewEngine returned null");
    }

    let allowed: Vec<CString> = settings
        .allowed_apps
        .iter()
        .map(|app| CString::new(app.as_str()))
        .collect::<Result<_, _>>()?;
    let allowed_ptrs: Vec<*const c_char> = allowed.iter().map(|app| app.as_ptr()).collect();

    // No protect callback: only the routes the user adds point at the tun,
    // so the upstream resolver is reached over the default route.
    let status = unsafe {
        SniffleEngineStart(
            engine,
            tun.fd(),
            ptr::null(),
            allowed_ptrs.as_ptr(),
            allowed_ptrs.len(),
        )
    };
    if status != SNIFFLE_OK {
        unsafe { SniffleFreeEngine(engine) };
        anyhow::bail!("SniffleEngineStart failed with status {}", status);
    }

    println!("[standalone] engine running. Press Ctrl+C to terminate.");
    let mut events = vec![SniffleTelemetryEvent::default(); 64];
    loop {
        thread::sleep(Duration::from_millis(500));
        let mut dropped = 0u64;
        let count = unsafe {
            SniffleTelemetryDrain(engine, events.as_mut_ptr(), events.len(), &mut dropped)
        };
        for event in &events[..count] {
            print_event(event);
        }
        if dropped > 0 {
            println!("[standalone] {dropped} telemetry events dropped");
        }
        if unsafe { SniffleEngineState(engine) } == LifecycleState::Stopped as i32 {
            println!("[standalone] interface closed; exiting");
            break;
        }
    }

    unsafe {
        SniffleEngineStop(engine);
        SniffleFreeEngine(engine);
    }
    Ok(())
}

fn print_event(event: &SniffleTelemetryEvent) {
    let qname = unsafe { CStr::from_ptr(event.qname.as_ptr()) }.to_string_lossy();
    let client = SocketAddrV4::new(Ipv4Addr::from(event.src_ip), event.src_port);
    match event.kind {
        kind if kind == EventKind::QueryObserved as u8 => {
            let qtype = if event.qtype == 0 {
                "?"
            } else {
                qtype_label(event.qtype)
            };
            println!("[standalone][dns] {client} {qname} {qtype}");
        }
        kind if kind == EventKind::ForwardFailed as u8 => {
            println!("[standalone][dns] {client} {qname} failed (reason {})", event.reason);
        }
        kind if kind == EventKind::ParseFailed as u8 => {
            println!("[standalone][dns] {client} sent an unparseable query");
        }
        _ => {}
    }
}

#[derive(Debug)]
struct Settings {
    upstream: SocketAddrV4,
    timeout_ms: u32,
    mtu: u32,
    tun: Option<String>,
    bind_interface: Option<String>,
    allowed_apps: Vec<String>,
    verbose: bool,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut settings = Self {
            upstream: sniffle_engine::config::DEFAULT_UPSTREAM_V4,
            timeout_ms: 2000,
            mtu: 1500,
            tun: None,
            bind_interface: None,
            allowed_apps: Vec::new(),
            verbose: false,
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
            };
            match arg.as_str() {
                "--upstream" => {
                    let raw = value("--upstream")?;
                    settings.upstream = raw
                        .parse::<SocketAddrV4>()
                        .or_else(|_| raw.parse::<Ipv4Addr>().map(|ip| SocketAddrV4::new(ip, 53)))
                        .map_err(|_| anyhow::anyhow!("invalid upstream '{raw}'"))?;
                }
                "--timeout-ms" => {
                    settings.timeout_ms = value("--timeout-ms")?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid timeout"))?;
                }
                "--mtu" => {
                    settings.mtu = value("--mtu")?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid mtu"))?;
                }
                "--tun" => settings.tun = Some(value("--tun")?),
                "--bind-interface" => settings.bind_interface = Some(value("--bind-interface")?),
                "--allow" => settings.allowed_apps.push(value("--allow")?),
                "--verbose" | "-v" => settings.verbose = true,
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --upstream <ip[:port]>, --timeout-ms <ms>, --mtu <value>, --tun <name|utun index>, --bind-interface <ifname>, --allow <app id>, --verbose",
                        arg
                    );
                }
            }
        }
        Ok(settings)
    }
}

struct TunInterface {
    fd: OwnedFd,
    name: String,
}

impl TunInterface {
    #[cfg(target_os = "linux")]
    fn open(name: Option<&str>) -> io::Result<Self> {
        use std::mem::zeroed;

        // _IOW('T', 202, int)
        const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

        let fd = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr().cast(),
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut request: libc::ifreq = unsafe { zeroed() };
        let requested = name.unwrap_or("sniffle%d").as_bytes();
        if requested.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        for (slot, byte) in request.ifr_name.iter_mut().zip(requested) {
            *slot = *byte as c_char;
        }
        request.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;
        let status = unsafe { libc::ioctl(owned.as_raw_fd(), TUNSETIFF as _, &mut request) };
        if status < 0 {
            return Err(io::Error::last_os_error());
        }
        let name = unsafe { CStr::from_ptr(request.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Ok(Self { fd: owned, name })
    }

    #[cfg(target_os = "macos")]
    fn open(unit: Option<&str>) -> io::Result<Self> {
        use std::mem::{size_of, zeroed};

        const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
        let unit: Option<u32> = match unit {
            Some(raw) => Some(
                raw.trim_start_matches("utun")
                    .parse()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid utun index"))?,
            ),
            None => None,
        };
        let fd =
            unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut info: libc::ctl_info = unsafe { zeroed() };
        for (idx, byte) in UTUN_CONTROL_NAME.iter().enumerate() {
            info.ctl_name[idx] = *byte as libc::c_char;
        }
        let ioctl_status = unsafe { libc::ioctl(owned.as_raw_fd(), libc::CTLIOCGINFO, &mut info) };
        if ioctl_status < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_ctl = unsafe { zeroed() };
        addr.sc_len = size_of::<libc::sockaddr_ctl>() as u8;
        addr.sc_family = libc::AF_SYSTEM as u8;
        addr.ss_sysaddr = libc::AF_SYS_CONTROL as u16;
        addr.sc_id = info.ctl_id;
        addr.sc_unit = unit.map(|value| value + 1).unwrap_or(0);

        let connect_status = unsafe {
            libc::connect(
                owned.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_ctl>() as u32,
            )
        };
        if connect_status < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut ifname = [0u8; libc::IFNAMSIZ];
        let mut ifname_len = ifname.len() as u32;
        let opt_status = unsafe {
            libc::getsockopt(
                owned.as_raw_fd(),
                libc::SYSPROTO_CONTROL,
                libc::UTUN_OPT_IFNAME,
                ifname.as_mut_ptr() as *mut c_void,
                &mut ifname_len,
            )
        };
        if opt_status < 0 {
            return Err(io::Error::last_os_error());
        }
        let trimmed_len = (ifname_len as usize).saturating_sub(1);
        let name = String::from_utf8_lossy(&ifname[..trimmed_len]).into_owned();
        Ok(Self { fd: owned, name })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn open(_name: Option<&str>) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "standalone runner supports Linux and macOS only",
        ))
    }

    fn fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }

    fn name(&self) -> &str {
        &self.name
    }

    /// utun frames carry a 4-byte address family header, Linux tun
    /// opened with `IFF_NO_PI` does not.
    fn packet_info(&self) -> bool {
        cfg!(target_os = "macos")
    }

    fn setup_hint(&self) -> String {
        if cfg!(target_os = "macos") {
            format!("sudo ifconfig {} inet 10.0.0.2 10.0.0.1 up", self.name)
        } else {
            format!(
                "sudo ip addr add 10.0.0.2/24 dev {0} && sudo ip link set {0} up",
                self.name
            )
        }
    }
}

fn install_log_sink(verbose: bool) {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        let level = if level.is_null() {
            "info".into()
        } else {
            unsafe { CStr::from_ptr(level) }.to_string_lossy()
        };
        eprintln!("[engine][{level}] {entry}");
    }

    let sink = SniffleLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: if verbose { u32::MAX } else { 0 },
    };
    let level: &[u8] = if verbose { b"debug\0" } else { b"info\0" };
    unsafe {
        SniffleSetLogSink(&sink, level.as_ptr().cast(), ptr::null_mut());
        SniffleSetBreadcrumbMask(sink.enabled_breadcrumbs);
    }
}

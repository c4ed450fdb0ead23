#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod device;
pub mod dns;
pub mod ffi;
pub mod interceptor;
pub mod logger;
pub mod packet;
pub mod telemetry;

pub use crate::config::EngineConfig;
pub use crate::device::{AllowedAppSet, TunDevice, TunHandle};
pub use crate::dns::{NoProtection, SocketProtector};
pub use crate::interceptor::LifecycleState;

use crate::ffi::{
    SniffleCallbacks, SniffleConfig, SniffleCounters, SniffleLogSink, SniffleTelemetryEvent,
    SNIFFLE_ERR_ALREADY_RUNNING, SNIFFLE_ERR_BAD_DEVICE, SNIFFLE_ERR_NULL_ENGINE,
    SNIFFLE_ERR_START_FAILED, SNIFFLE_OK,
};
use crate::dns::UpstreamClient;
use crate::interceptor::{Interceptor, LoopContext};
use crate::logger::BreadcrumbFlags;
use crate::telemetry::{CounterSnapshot, EngineCounters, EventKind, Telemetry, TelemetryEvent};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::io;
use std::os::raw::{c_char, c_int};
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("interception is already {}", .0.label())]
    AlreadyRunning(LifecycleState),
    #[error("failed to spawn interception threads: {0}")]
    Spawn(#[source] io::Error),
}

/// Controller owning the runtime, the lifecycle state and the telemetry of
/// one interception engine. Opaque to C hosts.
pub struct SniffleEngine {
    config: EngineConfig,
    runtime: Runtime,
    state: Arc<Mutex<LifecycleState>>,
    interceptor: Mutex<Option<Interceptor>>,
    telemetry: Arc<Telemetry>,
    counters: Arc<EngineCounters>,
}

impl SniffleEngine {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let config = config.normalized();
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sniffle-worker")
            .enable_io()
            .enable_time()
            .build()?;

        logger::breadcrumb(
            BreadcrumbFlags::FFI,
            format!(
                "SniffleEngine initialized (upstream={}, timeout={:?}, mtu={})",
                config.upstream, config.timeout, config.mtu
            ),
        );

        Ok(Self {
            config,
            runtime,
            state: Arc::new(Mutex::new(LifecycleState::Stopped)),
            interceptor: Mutex::new(None),
            telemetry: Arc::new(Telemetry::new()),
            counters: Arc::new(EngineCounters::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Begins intercepting on `device`. Upstream sockets are passed through
    /// `protector` before use.
    pub fn start(
        &self,
        device: TunDevice,
        protector: Arc<dyn SocketProtector>,
    ) -> Result<(), EngineError> {
        let mut slot = self.interceptor.lock();
        let current = self.state();
        if current != LifecycleState::Stopped {
            logger::warn(format!(
                "start requested while interception is {}; ignoring",
                current.label()
            ));
            return Err(EngineError::AlreadyRunning(current));
        }
        // Left behind by an implicit stop; its threads are already gone.
        if let Some(previous) = slot.take() {
            previous.stop();
        }

        let allowed_apps = device.allowed_apps().sorted();
        let context = LoopContext {
            config: self.config.clone(),
            upstream: Arc::new(UpstreamClient::from_config(&self.config, protector)),
            telemetry: Arc::clone(&self.telemetry),
            counters: Arc::clone(&self.counters),
            state: Arc::clone(&self.state),
            runtime: self.runtime.handle().clone(),
        };
        let interceptor = Interceptor::spawn(device, context).map_err(EngineError::Spawn)?;
        *slot = Some(interceptor);

        logger::info(format!(
            "interception started ({} allowed apps, upstream {})",
            allowed_apps.len(),
            self.config.upstream
        ));
        let mut event = TelemetryEvent::new(EventKind::InterfaceStarted);
        event.allowed_apps = allowed_apps;
        self.telemetry.record(event);
        Ok(())
    }

    /// Stops reading, waits for in-flight forwards and the writer, and
    /// returns once the state is `Stopped`. A no-op when not running.
    pub fn stop(&self) {
        let Some(interceptor) = self.interceptor.lock().take() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
            }
        }
        logger::breadcrumb(BreadcrumbFlags::FFI, "SniffleEngine stop requested");
        interceptor.stop();
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn drain_telemetry(&self, max_events: usize) -> (Vec<TelemetryEvent>, u64) {
        self.telemetry.drain(max_events)
    }
}

impl Drop for SniffleEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// # Safety
/// `apps` must be null or point to `count` pointers, each null or a
/// NUL-terminated string.
unsafe fn allowed_apps_from_raw(apps: *const *const c_char, count: usize) -> AllowedAppSet {
    if apps.is_null() || count == 0 {
        return AllowedAppSet::default();
    }
    let entries = unsafe { slice::from_raw_parts(apps, count) };
    AllowedAppSet::new(
        entries
            .iter()
            .filter(|entry| !entry.is_null())
            .filter_map(|entry| unsafe { CStr::from_ptr(*entry) }.to_str().ok()),
    )
}

#[no_mangle]
pub unsafe extern "C" fn SniffleNewEngine(config: *const SniffleConfig) -> *mut SniffleEngine {
    let config = match unsafe { config.as_ref() } {
        Some(raw) => unsafe { raw.to_engine_config() },
        None => EngineConfig::default(),
    };

    match SniffleEngine::new(config) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(error) => {
            crate::logger::error(format!("SniffleNewEngine failed: {error:?}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn SniffleFreeEngine(engine: *mut SniffleEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe {
            drop(Box::from_raw(engine.as_ptr()));
        }
    }
}

/// Starts intercepting on `tun_fd`. The descriptor is duplicated; the host
/// keeps ownership of the original and closes it after `SniffleEngineStop`.
#[no_mangle]
pub unsafe extern "C" fn SniffleEngineStart(
    engine: *mut SniffleEngine,
    tun_fd: c_int,
    callbacks: *const SniffleCallbacks,
    allowed_apps: *const *const c_char,
    allowed_app_count: usize,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return SNIFFLE_ERR_NULL_ENGINE;
    };
    let engine = unsafe { engine.as_ref() };
    let callbacks = unsafe { callbacks.as_ref() }.copied().unwrap_or_default();
    let protector = unsafe { callbacks.protector() };
    let apps = unsafe { allowed_apps_from_raw(allowed_apps, allowed_app_count) };

    let device = match TunDevice::from_fd(tun_fd, engine.config().packet_info) {
        Ok(device) => device.with_allowed_apps(apps),
        Err(error) => {
            crate::logger::error(format!("SniffleEngineStart: tun fd {tun_fd}: {error}"));
            return SNIFFLE_ERR_BAD_DEVICE;
        }
    };

    match engine.start(device, protector) {
        Ok(()) => SNIFFLE_OK,
        Err(EngineError::AlreadyRunning(_)) => SNIFFLE_ERR_ALREADY_RUNNING,
        Err(error) => {
            crate::logger::error(format!("SniffleEngineStart error: {error}"));
            SNIFFLE_ERR_START_FAILED
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn SniffleEngineStop(engine: *mut SniffleEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.stop();
    }
}

/// Returns the `LifecycleState` discriminant, or -1 for a null engine.
#[no_mangle]
pub unsafe extern "C" fn SniffleEngineState(engine: *mut SniffleEngine) -> i32 {
    match NonNull::new(engine) {
        Some(engine) => unsafe { engine.as_ref() }.state() as i32,
        None => SNIFFLE_ERR_NULL_ENGINE,
    }
}

#[no_mangle]
pub unsafe extern "C" fn SniffleEngineGetCounters(
    engine: *mut SniffleEngine,
    out: *mut SniffleCounters,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.counters().into();
    true
}

#[no_mangle]
pub unsafe extern "C" fn SniffleTelemetryDrain(
    engine: *mut SniffleEngine,
    out_events: *mut SniffleTelemetryEvent,
    max_events: usize,
    dropped_out: *mut u64,
) -> usize {
    let Some(engine) = NonNull::new(engine) else {
        return 0;
    };
    if out_events.is_null() || max_events == 0 {
        return 0;
    }
    let (events, dropped) = unsafe { engine.as_ref() }.drain_telemetry(max_events);
    if let Some(ptr) = unsafe { dropped_out.as_mut() } {
        *ptr = dropped;
    }
    let out_slice = unsafe { slice::from_raw_parts_mut(out_events, max_events) };
    for (slot, event) in out_slice.iter_mut().zip(&events) {
        *slot = SniffleTelemetryEvent::from(event);
    }
    events.len()
}

#[no_mangle]
pub unsafe extern "C" fn SniffleSetLogSink(
    sink: *const SniffleLogSink,
    level: *const c_char,
    _error: *mut *mut std::ffi::c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(level) }.to_str().ok()
    };
    crate::logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn SniffleSetBreadcrumbMask(mask: u32) {
    crate::logger::set_breadcrumb_mask(mask);
}

#[cfg(test)]
mod tests;

//! The interception loop.
//!
//! One reader thread drains the tun and classifies every frame. Each DNS
//! query becomes an independent task on the tokio runtime that forwards it
//! upstream and wraps the answer into a reply frame. Replies are queued to a
//! single writer thread, the only code that ever writes to the tun.
//!
//! ```text
//!   tun --read--> reader --spawn--> forward task --queue--> writer --write--> tun
//! ```
//!
//! A stop request, or the tun reporting an error, moves the loop to
//! `Draining`: the reader stops, every outstanding task runs to completion
//! (each is bounded by the upstream timeout), the writer flushes what they
//! produced, and only then is the state `Stopped`.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::config::EngineConfig;
use crate::device::{FrameReader, FrameWriter, TunDevice};
use crate::dns::{ForwardError, UpstreamClient};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::packet::{self, build_response_frame, Classification, DnsQuery, PassthroughReason};
use crate::telemetry::{EngineCounters, EventKind, FailureReason, Telemetry, TelemetryEvent};

/// How long one read waits before the stop flag is checked again.
const READ_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Running = 1,
    Draining = 2,
}

impl LifecycleState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Draining => "draining",
        }
    }
}

/// Everything the loop borrows from its controller.
#[derive(Clone)]
pub struct LoopContext {
    pub config: EngineConfig,
    pub upstream: Arc<UpstreamClient>,
    pub telemetry: Arc<Telemetry>,
    pub counters: Arc<EngineCounters>,
    pub state: Arc<Mutex<LifecycleState>>,
    pub runtime: Handle,
}

/// A reply frame waiting for the writer, with the event to record once it
/// is on the wire.
struct PendingReply {
    frame: Vec<u8>,
    event: TelemetryEvent,
}

/// State shared by every forwarding task.
struct Pipeline {
    upstream: Arc<UpstreamClient>,
    telemetry: Arc<Telemetry>,
    counters: Arc<EngineCounters>,
    replies: Sender<PendingReply>,
    max_answer_len: usize,
}

/// Handle to a running loop. Dropping it does not stop the loop; call
/// [`Interceptor::stop`].
pub struct Interceptor {
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Interceptor {
    /// Moves `state` to `Running` and starts the reader and writer threads.
    /// On error nothing is left running and `state` is untouched.
    pub fn spawn(device: TunDevice, context: LoopContext) -> io::Result<Self> {
        let (reader, writer, _) = device.into_parts();
        let stop = Arc::new(AtomicBool::new(false));
        let (replies_tx, replies_rx) = crossbeam_channel::unbounded::<PendingReply>();

        let writer_thread = {
            let telemetry = Arc::clone(&context.telemetry);
            let counters = Arc::clone(&context.counters);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("sniffle-tun-writer".into())
                .spawn(move || run_writer(writer, replies_rx, &telemetry, &counters, &stop))?
        };

        let previous = std::mem::replace(&mut *context.state.lock(), LifecycleState::Running);
        let pipeline = Arc::new(Pipeline {
            upstream: Arc::clone(&context.upstream),
            telemetry: Arc::clone(&context.telemetry),
            counters: Arc::clone(&context.counters),
            replies: replies_tx,
            max_answer_len: context.config.max_answer_len(),
        });
        let reader_loop = ReaderLoop {
            reader,
            pipeline,
            limiter: Arc::new(Semaphore::new(context.config.max_in_flight)),
            tasks: Vec::new(),
            buffer: vec![0u8; context.config.read_buffer_size],
            stop: Arc::clone(&stop),
            context: context.clone(),
        };
        let spawned = thread::Builder::new()
            .name("sniffle-tun-reader".into())
            .spawn(move || reader_loop.run(writer_thread));

        match spawned {
            Ok(reader) => {
                logger::breadcrumb(
                    BreadcrumbFlags::DEVICE,
                    format!(
                        "interception loop running (upstream={}, mtu={}, max_in_flight={})",
                        context.config.upstream, context.config.mtu, context.config.max_in_flight
                    ),
                );
                Ok(Self {
                    stop,
                    reader: Some(reader),
                })
            }
            Err(error) => {
                // The closure owning the reply sender was dropped, so the
                // writer thread sees a closed queue and exits on its own.
                *context.state.lock() = previous;
                Err(error)
            }
        }
    }

    /// Asks the reader to stop after its current read slice.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True once draining has finished and both threads are gone.
    pub fn is_finished(&self) -> bool {
        self.reader.as_ref().map_or(true, |reader| reader.is_finished())
    }

    /// Requests a stop and blocks until the loop is `Stopped`.
    pub fn stop(mut self) {
        self.request_stop();
        self.join_reader();
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                logger::error("tun reader thread panicked");
            }
        }
    }
}

struct ReaderLoop {
    reader: Box<dyn FrameReader>,
    pipeline: Arc<Pipeline>,
    limiter: Arc<Semaphore>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    buffer: Vec<u8>,
    stop: Arc<AtomicBool>,
    context: LoopContext,
}

impl ReaderLoop {
    fn run(mut self, writer_thread: JoinHandle<()>) {
        while !self.stop.load(Ordering::Acquire) {
            match self.reader.read_frame(&mut self.buffer, READ_SLICE) {
                Ok(Some(len)) => {
                    // Detach the buffer so `handle_frame` can borrow `self`.
                    let buffer = std::mem::take(&mut self.buffer);
                    self.handle_frame(&buffer[..len]);
                    self.buffer = buffer;
                }
                Ok(None) => {}
                Err(error) => {
                    logger::info(format!("tun read ended ({error}); stopping interception"));
                    break;
                }
            }
            self.tasks.retain(|task| !task.is_finished());
        }
        self.drain(writer_thread);
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        EngineCounters::bump(&self.context.counters.frames_read);
        let header = match packet::classify(frame) {
            Classification::DnsCandidate(header) => header,
            // Ordinary non-DNS traffic.
            Classification::Passthrough(
                PassthroughReason::NotUdp(_) | PassthroughReason::NotDnsPort(_),
            ) => return,
            Classification::Passthrough(reason) => {
                logger::debug(format!(
                    "passing through {}-byte frame: {}",
                    frame.len(),
                    reason.description()
                ));
                return;
            }
        };
        EngineCounters::bump(&self.context.counters.dns_candidates);

        let query = match DnsQuery::from_candidate(header, frame) {
            Ok(query) => query,
            Err(error) => {
                self.context.telemetry.record(
                    TelemetryEvent::new(EventKind::ParseFailed)
                        .from_client(header.src, header.src_port)
                        .with_reason(FailureReason::MalformedQuery)
                        .with_payload_len(frame.len()),
                );
                EngineCounters::bump(&self.context.counters.parse_failures);
                logger::rate_limited_error(
                    ErrorCategory::MalformedQuery,
                    format!("dropping query from {}:{}: {error}", header.src, header.src_port),
                );
                return;
            }
        };

        logger::breadcrumb(
            BreadcrumbFlags::DNS,
            format!(
                "query {} {} id={:#06x} from {}:{}",
                query.name,
                query.qtype.map_or("?", packet::qtype_label),
                query.id,
                header.src,
                header.src_port
            ),
        );
        self.context.telemetry.record(
            TelemetryEvent::new(EventKind::QueryObserved)
                .from_client(header.src, header.src_port)
                .with_query(&query.name, query.qtype)
                .with_payload_len(query.request.len()),
        );
        self.dispatch(query);
    }

    fn dispatch(&mut self, query: DnsQuery) {
        let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
            self.pipeline.fail(&query, &ForwardError::Busy);
            return;
        };
        EngineCounters::bump(&self.context.counters.queries_forwarded);
        let pipeline = Arc::clone(&self.pipeline);
        let task = self.context.runtime.spawn(async move {
            let _permit = permit;
            pipeline.forward(query).await;
        });
        self.tasks.push(task);
    }

    fn drain(self, writer_thread: JoinHandle<()>) {
        {
            let mut state = self.context.state.lock();
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
            }
        }
        let outstanding = self.tasks.len();
        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            format!("draining {outstanding} in-flight forwards"),
        );
        let tasks = self.tasks;
        self.context.runtime.block_on(async move {
            for task in tasks {
                let _ = task.await;
            }
        });

        // Last sender goes away here; the writer flushes and exits.
        drop(self.pipeline);
        if writer_thread.join().is_err() {
            logger::error("tun writer thread panicked");
        }
        drop(self.reader);

        *self.context.state.lock() = LifecycleState::Stopped;
        self.context
            .telemetry
            .record(TelemetryEvent::new(EventKind::InterfaceStopped));
        logger::info("interception stopped");
    }
}

impl Pipeline {
    async fn forward(&self, query: DnsQuery) {
        let answer = match self.upstream.forward(&query.request).await {
            Ok(answer) => answer,
            Err(error) => {
                self.fail(&query, &error);
                return;
            }
        };
        let frame = match build_response_frame(&query.header, &answer.bytes, self.max_answer_len) {
            Ok(frame) => frame,
            Err(error) => {
                self.telemetry.record(
                    self.event(EventKind::ForwardFailed, &query)
                        .with_reason(FailureReason::Rewrite)
                        .with_payload_len(answer.bytes.len()),
                );
                EngineCounters::bump(&self.counters.forward_failures);
                logger::rate_limited_error(
                    ErrorCategory::RewriteFailure,
                    format!("cannot answer {}: {error}", query.name),
                );
                return;
            }
        };
        let event = self
            .event(EventKind::ResponseWritten, &query)
            .with_payload_len(frame.len());
        if self.replies.send(PendingReply { frame, event }).is_err() {
            logger::breadcrumb(
                BreadcrumbFlags::REWRITE,
                format!("writer gone; reply for {} discarded", query.name),
            );
        }
    }

    fn fail(&self, query: &DnsQuery, error: &ForwardError) {
        self.telemetry.record(
            self.event(EventKind::ForwardFailed, query)
                .with_reason(FailureReason::from(error)),
        );
        EngineCounters::bump(&self.counters.forward_failures);
        let category = match error {
            ForwardError::Busy => ErrorCategory::CapacityExhausted,
            ForwardError::Unprotected(_) => ErrorCategory::CallbackError,
            _ => ErrorCategory::UpstreamFailure,
        };
        logger::rate_limited_error(category, format!("{} dropped: {error}", query.name));
    }

    fn event(&self, kind: EventKind, query: &DnsQuery) -> TelemetryEvent {
        TelemetryEvent::new(kind)
            .from_client(query.header.src, query.header.src_port)
            .with_query(&query.name, query.qtype)
    }
}

fn run_writer(
    mut writer: Box<dyn FrameWriter>,
    replies: Receiver<PendingReply>,
    telemetry: &Telemetry,
    counters: &EngineCounters,
    stop: &AtomicBool,
) {
    for reply in replies.iter() {
        match writer.write_frame(&reply.frame) {
            Ok(()) => {
                logger::breadcrumb(
                    BreadcrumbFlags::REWRITE,
                    format!(
                        "wrote {} byte reply for {}",
                        reply.frame.len(),
                        reply.event.qname.as_deref().unwrap_or("")
                    ),
                );
                telemetry.record(reply.event);
                EngineCounters::bump(&counters.responses_written);
            }
            Err(error) => {
                logger::rate_limited_error(
                    ErrorCategory::InterfaceWrite,
                    format!("tun write failed ({error}); stopping interception"),
                );
                stop.store(true, Ordering::Release);
                break;
            }
        }
    }
}

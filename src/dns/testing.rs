//! Loopback resolver stubs for tests.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Handler = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// UDP server on `127.0.0.1:0` that feeds every datagram to a handler and
/// sends back whatever it returns.
pub(crate) struct StubUpstream {
    addr: SocketAddr,
    received: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl StubUpstream {
    pub(crate) fn start<F>(handler: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind stub upstream");
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("stub read timeout");
        let addr = socket.local_addr().expect("stub addr");
        let received = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let handler: Arc<Handler> = Arc::new(handler);

        let worker = {
            let received = Arc::clone(&received);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut buffer = [0u8; 4096];
                while !stop.load(Ordering::SeqCst) {
                    let Ok((len, peer)) = socket.recv_from(&mut buffer) else {
                        continue;
                    };
                    received.fetch_add(1, Ordering::SeqCst);
                    if let Some(reply) = handler(&buffer[..len]) {
                        let _ = socket.send_to(&reply, peer);
                    }
                }
            })
        };

        Self {
            addr,
            received,
            stop,
            worker: Some(worker),
        }
    }

    /// Never replies.
    pub(crate) fn silent() -> Self {
        Self::start(|_| None)
    }

    /// Replies to every query with `reply(query)`.
    pub(crate) fn answering<F>(reply: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        Self::start(move |query| Some(reply(query)))
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub(crate) fn received_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.received)
    }
}

impl Drop for StubUpstream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

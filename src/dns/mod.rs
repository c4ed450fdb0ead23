//! One-shot UDP exchanges with the configured upstream resolver.

pub mod protect;

pub use protect::{CallbackProtector, NoProtection, SocketProtector};

use crate::config::EngineConfig;
use crate::logger::{self, BreadcrumbFlags};
use crate::packet::DNS_HEADER_LEN;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time;

/// Largest datagram a UDP length field can describe; a reply never exceeds
/// it, so `recv` cannot cut one short.
const MAX_REPLY_LEN: usize = u16::MAX as usize;

/// Raw reply datagram from the upstream resolver.
#[derive(Debug, Clone)]
pub struct UpstreamAnswer {
    pub bytes: Vec<u8>,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no reply from {server} within {timeout:?}")]
    Timeout { server: SocketAddr, timeout: Duration },
    #[error("{stage} failed for {server}: {source}")]
    Network {
        stage: &'static str,
        server: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("host refused to protect upstream socket (fd {0})")]
    Unprotected(RawFd),
    #[error("reply id {got:#06x} does not match query id {expected:#06x}")]
    IdMismatch { expected: u16, got: u16 },
    #[error("request of {0} bytes is shorter than a DNS header")]
    MalformedRequest(usize),
    #[error("forwarding capacity exhausted")]
    Busy,
}

impl ForwardError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Forwards queries to a fixed resolver, one fresh socket per query.
pub struct UpstreamClient {
    server: SocketAddr,
    timeout: Duration,
    bind_interface: Option<String>,
    protector: Arc<dyn SocketProtector>,
}

impl UpstreamClient {
    pub fn new(server: SocketAddr, timeout: Duration, protector: Arc<dyn SocketProtector>) -> Self {
        Self {
            server,
            timeout,
            bind_interface: None,
            protector,
        }
    }

    pub fn from_config(config: &EngineConfig, protector: Arc<dyn SocketProtector>) -> Self {
        Self {
            bind_interface: config.bind_interface.clone(),
            ..Self::new(config.upstream, config.timeout, protector)
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` and waits for exactly one reply.
    ///
    /// The whole exchange shares one deadline. There is no retry: a lost
    /// reply surfaces as [`ForwardError::Timeout`] and the stub resolver in the
    /// application retries on its own. The socket is closed on every return
    /// path when it goes out of scope.
    pub async fn forward(&self, request: &[u8]) -> Result<UpstreamAnswer, ForwardError> {
        if request.len() < DNS_HEADER_LEN {
            return Err(ForwardError::MalformedRequest(request.len()));
        }
        let started = Instant::now();
        let socket = self.open_socket()?;

        let exchange = async {
            socket
                .send(request)
                .await
                .map_err(|error| self.network("send", error))?;
            let mut buffer = vec![0u8; MAX_REPLY_LEN];
            let len = socket
                .recv(&mut buffer)
                .await
                .map_err(|error| self.network("recv", error))?;
            Ok::<_, ForwardError>(buffer[..len].to_vec())
        };

        let bytes = match time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ForwardError::Timeout {
                    server: self.server,
                    timeout: self.timeout,
                })
            }
        };

        let expected = u16::from_be_bytes([request[0], request[1]]);
        let got = match bytes.get(..2) {
            Some(id) => u16::from_be_bytes([id[0], id[1]]),
            None => {
                return Err(self.network(
                    "recv",
                    io::Error::new(io::ErrorKind::InvalidData, "reply shorter than an id"),
                ))
            }
        };
        if got != expected {
            return Err(ForwardError::IdMismatch { expected, got });
        }

        let elapsed = started.elapsed();
        logger::breadcrumb(
            BreadcrumbFlags::UPSTREAM,
            format!(
                "{} answered id {:#06x} with {} bytes in {:?}",
                self.server,
                expected,
                bytes.len(),
                elapsed
            ),
        );
        Ok(UpstreamAnswer { bytes, elapsed })
    }

    fn open_socket(&self) -> Result<UdpSocket, ForwardError> {
        let socket = Socket::new(
            Domain::for_address(self.server),
            Type::DGRAM,
            Some(Protocol::UDP),
        )
        .map_err(|error| self.network("socket", error))?;

        if let Some(interface) = self.bind_interface.as_deref() {
            self.bind_to_interface(&socket, interface)?;
        }

        let local: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket
            .bind(&local.into())
            .map_err(|error| self.network("bind", error))?;

        // Must happen before the first datagram leaves.
        let fd = socket.as_raw_fd();
        if !self.protector.protect(fd) {
            logger::warn(format!("upstream socket fd {fd} could not be protected"));
            return Err(ForwardError::Unprotected(fd));
        }

        socket
            .connect(&self.server.into())
            .map_err(|error| self.network("connect", error))?;
        socket
            .set_nonblocking(true)
            .map_err(|error| self.network("socket", error))?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| self.network("socket", error))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn bind_to_interface(&self, socket: &Socket, interface: &str) -> Result<(), ForwardError> {
        socket
            .bind_device(Some(interface.as_bytes()))
            .map_err(|error| self.network("bind_device", error))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn bind_to_interface(&self, _socket: &Socket, interface: &str) -> Result<(), ForwardError> {
        logger::breadcrumb(
            BreadcrumbFlags::UPSTREAM,
            format!("interface binding to {interface} unsupported on this platform; skipped"),
        );
        Ok(())
    }

    fn network(&self, stage: &'static str, source: io::Error) -> ForwardError {
        ForwardError::Network {
            stage,
            server: self.server,
            source,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;

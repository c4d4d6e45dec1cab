//! UDP transport between nodes.
//!
//! One socket per queue, all bound to the same port with `SO_REUSEPORT`
//! so the kernel load-balances incoming datagrams across queues.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tracing::{info, trace};

use super::Socket;
use crate::mapping::Mapping;
use crate::payload::Payload;

/// Default listen port
pub const DEFAULT_PORT: u16 = 1099;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UdpTransport {
    sockets: Vec<UdpSocket>,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind `queues` sockets to `addr`. Port 0 picks one port for all of them.
    pub fn bind(addr: SocketAddr, queues: usize) -> io::Result<Self> {
        let mut sockets = Vec::with_capacity(queues.max(1));
        let mut addr = addr;

        for _ in 0..queues.max(1) {
            let socket =
                RawSocket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_port(true)?;
            socket.set_read_timeout(Some(READ_TIMEOUT))?;
            socket.bind(&addr.into())?;

            let socket = UdpSocket::from(socket);
            if addr.port() == 0 {
                addr = socket.local_addr()?;
            }
            sockets.push(socket);
        }

        info!(address = %addr, queues = sockets.len(), "UDP transport bound");
        Ok(Self {
            sockets,
            local_addr: addr,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Translate a peer endpoint to the socket's address family.
    fn target(&self, endpoint: SocketAddr) -> Option<SocketAddr> {
        match (self.local_addr.ip(), endpoint.ip()) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => Some(endpoint),
            (IpAddr::V6(_), IpAddr::V4(v4)) => Some(SocketAddr::new(
                IpAddr::V6(v4.to_ipv6_mapped()),
                endpoint.port(),
            )),
            (IpAddr::V4(_), IpAddr::V6(v6)) => v6
                .to_ipv4_mapped()
                .map(|v4| SocketAddr::new(IpAddr::V4(v4), endpoint.port())),
        }
    }
}

impl Socket for UdpTransport {
    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Option<Payload<'a>> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        let socket = self.sockets.get(queue)?;
        match socket.recv_from(buf) {
            // recv_from truncates silently; a full buffer means the datagram did not fit
            Ok((n, from)) if n >= buf.len() => {
                trace!(queue, %from, "oversized datagram");
                None
            }
            Ok((n, from)) => {
                let payload = Payload::from_socket(buf, n);
                if payload.is_none() {
                    trace!(queue, %from, len = n, "runt datagram");
                }
                payload
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                None
            }
            Err(e) => {
                trace!(queue, error = %e, "UDP receive failed");
                None
            }
        }
    }

    fn write(&self, queue: usize, payload: &Payload<'_>, mapping: &Mapping) -> bool {
        let (Some(socket), Some(target)) =
            (self.sockets.get(queue), self.target(mapping.endpoint()))
        else {
            return false;
        };
        match socket.send_to(payload.wire(), target) {
            Ok(n) => n == payload.length(),
            Err(e) => {
                trace!(queue, %target, error = %e, "UDP send failed");
                false
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn fds(&self) -> Vec<RawFd> {
        self.sockets.iter().map(|s| s.as_raw_fd()).collect()
    }
}

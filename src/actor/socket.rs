//! UDP sockets the engine's datagrams arrive on.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::trace;

const MTU: usize = 2048;

/// The maximum duration to backoff checking the sockets after they are empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Non-blocking reader over the sockets the engine was initialized with.
#[derive(Debug)]
pub struct DhtSocket {
    sockets: Vec<UdpSocket>,
    local_addrs: Vec<SocketAddr>,
    buf: Box<[u8; MTU]>,
    /// Next socket to read from, so a busy socket doesn't starve the others.
    next: usize,
}

impl DhtSocket {
    pub(crate) fn new(sockets: Vec<UdpSocket>) -> Result<Self, std::io::Error> {
        let mut local_addrs = Vec::with_capacity(sockets.len());

        for socket in &sockets {
            socket.set_nonblocking(true)?;
            local_addrs.push(socket.local_addr()?);
        }

        Ok(Self {
            sockets,
            local_addrs,
            buf: Box::new([0; MTU]),
            next: 0,
        })
    }

    // === Getters ===

    /// Returns the addresses of the sockets.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    // === Public Methods ===

    /// Returns the next pending datagram from any socket, without blocking.
    pub fn recv_from(&mut self) -> Option<(&[u8], SocketAddr)> {
        let count = self.sockets.len();

        for offset in 0..count {
            let index = (self.next + offset) % count;

            match self.sockets[index].recv_from(&mut self.buf[..]) {
                Ok((amt, from)) => {
                    self.next = (index + 1) % count;

                    if from.port() == 0 {
                        trace!(context = "socket_validation", ?from, "Ignoring datagram from port 0");
                        continue;
                    }
                    if amt == MTU {
                        trace!(context = "socket_validation", ?from, "Datagram may be truncated");
                    }

                    return Some((&self.buf[..amt], from));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    trace!(
                        context = "socket_error",
                        ?e,
                        "recv_from failed unexpectedly"
                    );
                }
            }
        }

        None
    }
}

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token};
use tracing::debug;

/// Outcome of a socket-level operation.
///
/// `Alive` means the connection is still usable; `Disconnected` means the
/// peer is gone (or the socket errored) and the caller must tear the
/// connection down. No automatic reconnection happens at this layer — that
/// decision belongs to whoever owns the higher-level connection lifecycle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Alive,
    Disconnected,
}

const RX_SCRATCH_SIZE: usize = 32 * 1024;

/// A single non-blocking `mio`-backed TCP connection.
///
/// Unlike a fixed-framing transport, `TcpStream` does not know anything
/// about message boundaries: [`read_into`](Self::read_into) simply appends
/// every byte currently available on the socket to the caller's buffer, and
/// [`write_or_enqueue`](Self::write_or_enqueue) writes a caller-supplied byte
/// blob (already framed by a codec) immediately or queues it if the kernel
/// send buffer is full.
///
/// Backlogged writes are flushed whenever the socket becomes writable again;
/// `WRITABLE` interest is only registered while the backlog is non-empty.
pub struct TcpStream {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    token: Token,

    rx_scratch: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,

    /// Invariant: `writable_armed == !send_backlog.is_empty()`.
    writable_armed: bool,
}

impl TcpStream {
    pub(crate) fn from_mio(
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        token: Token,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer_addr,
            token,
            rx_scratch: vec![0; RX_SCRATCH_SIZE],
            send_backlog: VecDeque::with_capacity(16),
            writable_armed: false,
        })
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    /// Wraps a `mio::net::TcpStream` that a caller outside this crate already
    /// owns and has registered for `WRITABLE` via
    /// [`connect_nonblocking`](crate::tcp::connect_nonblocking) — the
    /// outbound-connect path, where the raw socket crosses the crate
    /// boundary before the connection is confirmed. Drops the `WRITABLE`
    /// interest (no longer needed once connected) and arms `READABLE`.
    pub fn from_connected(
        mut stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        token: Token,
        registry: &Registry,
    ) -> io::Result<Self> {
        registry.reregister(&mut stream, token, Interest::READABLE)?;
        Self::from_mio(stream, peer_addr, token)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Reads everything currently available on the socket into `in_buf`,
    /// looping until the kernel would block. Returns `Disconnected` if the
    /// peer closed the connection or a non-recoverable I/O error occurred.
    #[inline]
    pub fn read_into(&mut self, in_buf: &mut Vec<u8>) -> ConnState {
        loop {
            match self.stream.read(&mut self.rx_scratch) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => in_buf.extend_from_slice(&self.rx_scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?err, "conduit-net: read failed");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Writes `data` immediately if possible, otherwise enqueues it (and any
    /// unwritten remainder) to be flushed on the next writable event.
    #[inline]
    pub fn write_or_enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        if !self.send_backlog.is_empty() {
            return self.enqueue_back(registry, data);
        }

        match self.stream.write(&data) {
            Ok(0) => {
                debug!("conduit-net: write returned 0, treating as disconnected");
                ConnState::Disconnected
            }
            Ok(n) if n == data.len() => ConnState::Alive,
            Ok(n) => {
                let remainder = data[n..].to_vec();
                self.enqueue_front(registry, remainder)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, data)
            }
            Err(err) => {
                debug!(?err, "conduit-net: write failed");
                ConnState::Disconnected
            }
        }
    }

    /// Flushes backlogged writes until the kernel blocks again or the
    /// backlog drains. Called on a `WRITABLE` readiness event.
    #[inline]
    pub fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) if n == front.len() => {
                    self.send_backlog.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "conduit-net: backlog flush failed");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "conduit-net: reregister to drop writable failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    #[inline]
    fn enqueue_front(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_front(data);
        self.arm_writable(registry)
    }

    #[inline]
    fn enqueue_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    #[inline]
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "conduit-net: arm writable failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Raw, non-blocking access to the underlying socket for the TLS
    /// handshake step (behind `feature = "tls"`), which needs to call
    /// `read`/`write` directly on the wire rather than through the
    /// application-buffer path above.
    pub fn raw(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }
}

/// Sets kernel `SO_SNDBUF`/`SO_RCVBUF` on a not-yet-wrapped `mio::net::TcpStream`.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

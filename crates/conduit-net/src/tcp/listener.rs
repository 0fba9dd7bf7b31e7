use std::{io, net::SocketAddr};

use mio::{Interest, Registry, Token, net::TcpListener as MioTcpListener};

use crate::tcp::{TcpStream, stream::set_socket_buf_size};

/// Thin wrapper over a non-blocking `mio` listening socket.
///
/// Registration/deregistration and the accept loop itself are driven by the
/// dispatcher (conduit-rt), which owns the shared `mio::Poll`; this type
/// only knows how to bind, register and accept.
pub struct TcpListener {
    inner: MioTcpListener,
    token: Token,
    socket_buf_size: Option<usize>,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<MioTcpListener> {
        // `mio::net::TcpListener::bind` always uses the OS default backlog;
        // a non-zero caller-supplied backlog is applied via a raw `listen()`
        // call on the underlying socket when it differs from 0 ("system
        // default" per the configuration contract).
        let listener = MioTcpListener::bind(addr)?;
        if backlog != 0 {
            use std::os::fd::AsRawFd;
            unsafe {
                libc::listen(listener.as_raw_fd(), backlog as libc::c_int);
            }
        }
        Ok(listener)
    }

    pub fn from_mio(inner: MioTcpListener, token: Token) -> Self {
        Self { inner, token, socket_buf_size: None }
    }

    pub fn with_socket_buf_size(mut self, size: Option<usize>) -> Self {
        self.socket_buf_size = size;
        self
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.inner, self.token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts at most one pending connection. Returns `Ok(None)` if there is
    /// nothing to accept right now (`WouldBlock`).
    pub fn try_accept(&mut self, stream_token: Token) -> io::Result<Option<TcpStream>> {
        match self.inner.accept() {
            Ok((stream, peer_addr)) => {
                if let Some(size) = self.socket_buf_size {
                    set_socket_buf_size(&stream, size);
                }
                Ok(Some(TcpStream::from_mio(stream, peer_addr, stream_token)?))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Initiates a non-blocking outbound connection. The connection is not
/// usable until a `WRITABLE` readiness event fires for `token` and
/// `take_error` confirms there was no connection-refused/unreachable error.
pub fn connect_nonblocking(
    addr: SocketAddr,
    registry: &Registry,
    token: Token,
    socket_buf_size: Option<usize>,
) -> io::Result<mio::net::TcpStream> {
    let mut stream = mio::net::TcpStream::connect(addr)?;
    if let Some(size) = socket_buf_size {
        set_socket_buf_size(&stream, size);
    }
    registry.register(&mut stream, token, Interest::WRITABLE)?;
    Ok(stream)
}

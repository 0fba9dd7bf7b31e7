use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use conduit_net::tcp::{TcpListener, TcpStream, connect_nonblocking};
use mio::{Events, Token, event::Event};

use conduit_support::{Repeater, ThreadPriority, thread_boot};

use crate::{
    codec::Codec,
    communicator::Communicator,
    config::Config,
    container::Container,
    error::Error,
    ids::{ConnId, ConnIdGenerator, MsgId},
};

/// How long a worker blocks inside `Poll::poll` before giving another worker
/// a chance at the poll gate and re-running the periodic sweep. Also bounds
/// how quickly a fresh listener/connect registration gets its first look-in.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long an idle worker waits on the work condvar before looping back to
/// try the poll gate again.
const WAKE_INTERVAL: Duration = Duration::from_millis(5);
/// Upper bound `Drop` gives an already-running dispatcher to shut down
/// gracefully before falling back to an unconditional blocking join.
const DROP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum TokenKind {
    Listener(usize),
    Connecting,
    Conn(ConnId),
}

struct PendingConnect {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    on_error: Option<Box<dyn FnOnce(io::Error) + Send>>,
    #[cfg(feature = "tls")]
    server_name: Option<rustls::pki_types::ServerName<'static>>,
}

struct ListenerSlot<C: Codec> {
    listener: TcpListener,
    after_accept: Option<Arc<dyn Fn(&TcpStream) + Send + Sync>>,
    _marker: std::marker::PhantomData<fn() -> C>,
}

/// Owns the shared reactor and the worker pool that drives every
/// communicator's `process()`. One `mio::Poll` is shared across all workers
/// behind a `try_lock` gate (`poll`): whichever worker wins the gate each
/// round is the one that calls `Poll::poll` and translates readiness events
/// into ready-queue pushes; every worker, gate-holder or not, then drains the
/// ready queue via `Container::take_out_id`/`get_back`.
pub struct Dispatcher<C: Codec> {
    config: Arc<Config<C>>,
    container: Arc<Container<C>>,
    poll: Mutex<mio::Poll>,
    registry: mio::Registry,
    conn_ids: ConnIdGenerator,
    next_token: AtomicUsize,
    tokens: Mutex<HashMap<Token, TokenKind>>,
    listeners: Mutex<Vec<ListenerSlot<C>>>,
    pending_connects: Mutex<HashMap<Token, PendingConnect>>,

    ready_queue: Mutex<VecDeque<ConnId>>,
    work_cv: Condvar,
    kick_count: AtomicUsize,
    run_count: AtomicUsize,

    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    idle: Mutex<Repeater>,

    #[cfg(feature = "tls")]
    tls_server_config: Option<Arc<rustls::ServerConfig>>,
    #[cfg(feature = "tls")]
    tls_client_config: Option<Arc<rustls::ClientConfig>>,
}

impl<C: Codec> Dispatcher<C> {
    pub fn new(config: Config<C>) -> io::Result<Arc<Self>> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let idle_interval = config.dispatcher_idle_tout;
        #[cfg(feature = "tls")]
        let (tls_server_config, tls_client_config) = load_tls_configs(config.tls.as_ref())?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            container: Arc::new(Container::default()),
            poll: Mutex::new(poll),
            registry,
            conn_ids: ConnIdGenerator::default(),
            next_token: AtomicUsize::new(0),
            tokens: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            pending_connects: Mutex::new(HashMap::new()),
            ready_queue: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            kick_count: AtomicUsize::new(0),
            run_count: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            idle: Mutex::new(Repeater::every(idle_interval)),
            #[cfg(feature = "tls")]
            tls_server_config,
            #[cfg(feature = "tls")]
            tls_client_config,
        }))
    }

    pub fn config(&self) -> &Config<C> {
        &self.config
    }

    fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn kick(&self, id: ConnId) {
        self.ready_queue.lock().unwrap().push_back(id);
        self.bounded_notify();
    }

    fn bounded_notify(&self) {
        loop {
            let current = self.kick_count.load(Ordering::Acquire);
            if current >= self.run_count.load(Ordering::Acquire).max(1) {
                return;
            }
            if self
                .kick_count
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.work_cv.notify_one();
                return;
            }
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Starts the worker pool. No-op if already running.
    pub fn run(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let n = self.config.worker_threads;
        self.run_count.store(n, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..n {
            let this = Arc::clone(self);
            workers.push(std::thread::spawn(move || this.worker_loop(worker_id)));
        }
    }

    /// Orderly shutdown: disconnects every connection (closing its socket and
    /// firing `on_disconnected`), waits up to `timeout` for the container to
    /// drain, then stops the worker pool and waits for the remainder of
    /// `timeout` for every worker thread to exit. Returns true iff every
    /// worker left its run loop before the deadline; a worker still running
    /// past the deadline is left in the pool for a later `stop` call (or
    /// `Drop`) to finish joining.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.shutdown(Instant::now() + timeout)
    }

    fn shutdown(&self, deadline: Instant) -> bool {
        // Kicked while `running` is still true so the worker pool's own loop
        // drains the disconnects; flipping `running` first would risk a
        // worker parked on the condvar waking up, seeing `running == false`,
        // and exiting without ever draining the freshly-kicked connections.
        self.disconnect_all();
        while !self.container.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        self.running.store(false, Ordering::Release);
        self.work_cv.notify_all();

        let mut workers = self.workers.lock().unwrap();
        let mut remaining = Vec::new();
        let mut all_exited = true;
        for handle in workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                all_exited = false;
                remaining.push(handle);
            }
        }
        *workers = remaining;
        all_exited
    }

    /// Tears down every connection and listener, ready for a fresh `run()`.
    /// Must be called while stopped.
    pub fn reset(&self) {
        for comm in self.container.snapshot() {
            comm.disconnect();
        }
        for id in self.container.connections() {
            self.container.erase(id);
        }
        let mut listeners = self.listeners.lock().unwrap();
        for slot in listeners.drain(..) {
            let mut listener = slot.listener;
            let _ = listener.deregister(&self.registry);
        }
        self.tokens.lock().unwrap().clear();
        self.pending_connects.lock().unwrap().clear();
        self.ready_queue.lock().unwrap().clear();
        self.kick_count.store(0, Ordering::Release);
    }

    // ---- listen / connect ------------------------------------------------

    pub fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        self.listen_with(addr, None)
    }

    /// `after_accept` is invoked once per accepted connection, before it is
    /// handed to the container — the hook point for socket-option tuning
    /// that the spec's server front end names.
    pub fn listen_with(
        &self,
        addr: SocketAddr,
        after_accept: Option<Arc<dyn Fn(&TcpStream) + Send + Sync>>,
    ) -> io::Result<SocketAddr> {
        let raw = TcpListener::bind(addr, self.config.tcp_backlog)?;
        let token = self.alloc_token();
        let mut listener = TcpListener::from_mio(raw, token).with_socket_buf_size(self.config.socket_buf_size);
        listener.register(&self.registry)?;
        let local_addr = listener.local_addr()?;

        let mut listeners = self.listeners.lock().unwrap();
        let idx = listeners.len();
        listeners.push(ListenerSlot { listener, after_accept, _marker: std::marker::PhantomData });
        drop(listeners);

        self.tokens.lock().unwrap().insert(token, TokenKind::Listener(idx));
        Ok(local_addr)
    }

    /// One-shot asynchronous connect. `on_error` fires exactly once if the
    /// connection attempt fails (refused, unreachable, timed out at the TCP
    /// level); on success the communicator is created directly and the
    /// session's `connected` event fires on its first `process()` tick. No
    /// automatic reconnection is attempted.
    pub fn connect(&self, addr: SocketAddr, on_error: impl FnOnce(io::Error) + Send + 'static) -> io::Result<()> {
        let token = self.alloc_token();
        let stream = connect_nonblocking(addr, &self.registry, token, self.config.socket_buf_size)?;
        self.tokens.lock().unwrap().insert(token, TokenKind::Connecting);
        #[cfg(not(feature = "tls"))]
        let pending = PendingConnect { stream, peer_addr: addr, on_error: Some(Box::new(on_error)) };
        #[cfg(feature = "tls")]
        let pending =
            PendingConnect { stream, peer_addr: addr, on_error: Some(Box::new(on_error)), server_name: None };
        self.pending_connects.lock().unwrap().insert(token, pending);
        Ok(())
    }

    /// Connect with a TLS handshake chained once the TCP connect completes.
    /// `server_name` is checked against the peer certificate.
    #[cfg(feature = "tls")]
    pub fn connect_tls(
        &self,
        addr: SocketAddr,
        server_name: rustls::pki_types::ServerName<'static>,
        on_error: impl FnOnce(io::Error) + Send + 'static,
    ) -> io::Result<()> {
        let token = self.alloc_token();
        let stream = connect_nonblocking(addr, &self.registry, token, self.config.socket_buf_size)?;
        self.tokens.lock().unwrap().insert(token, TokenKind::Connecting);
        let pending = PendingConnect {
            stream,
            peer_addr: addr,
            on_error: Some(Box::new(on_error)),
            server_name: Some(server_name),
        };
        self.pending_connects.lock().unwrap().insert(token, pending);
        Ok(())
    }

    // ---- application-facing operations -----------------------------------

    pub fn send_one(&self, id: ConnId, message: C::Message) -> Result<MsgId, Error> {
        let comm = self.container.get(id)?;
        let msg_id = comm.send(message);
        self.kick(id);
        Ok(msg_id)
    }

    pub fn send_all(&self, build: impl Fn() -> C::Message) {
        for comm in self.container.snapshot() {
            comm.send(build());
            self.kick(comm.id());
        }
    }

    pub fn disconnect_one(&self, id: ConnId) {
        if let Ok(comm) = self.container.get(id) {
            comm.disconnect();
            self.kick(id);
        }
    }

    pub fn disconnect_all(&self) {
        for comm in self.container.snapshot() {
            comm.disconnect();
            self.kick(comm.id());
        }
    }

    pub fn connections(&self) -> Vec<ConnId> {
        self.container.connections()
    }

    pub fn remote_endpoint(&self, id: ConnId) -> Result<SocketAddr, Error> {
        Ok(self.container.get(id)?.remote_endpoint())
    }

    // ---- worker loop -------------------------------------------------

    fn worker_loop(self: Arc<Self>, worker_id: usize) {
        thread_boot(None, ThreadPriority::OSDefault);
        while self.running.load(Ordering::Acquire) {
            self.run_poll_round();
            self.drain_ready();

            if worker_id == 0 {
                self.maybe_fire_after_round();
            }

            if !self.running.load(Ordering::Acquire) {
                break;
            }
            let guard = self.ready_queue.lock().unwrap();
            if guard.is_empty() {
                let _ = self.work_cv.wait_timeout(guard, WAKE_INTERVAL);
            }
        }
    }

    fn run_poll_round(&self) {
        let Ok(mut poll) = self.poll.try_lock() else { return };
        let mut events = Events::with_capacity(256);
        match poll.poll(&mut events, Some(POLL_INTERVAL)) {
            Ok(()) => {
                for event in events.iter() {
                    self.handle_event(event);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => tracing::warn!(%err, "mio poll failed"),
        }
        drop(poll);

        // Periodic sweep: every live connection gets a process() tick on
        // this cadence even with no fresh readiness events, since reply
        // timeouts and application-initiated sends aren't tied to socket
        // readiness. Gated on the configured idle timer; `fired()` never
        // returns true for a zero `dispatcher_idle_tout`, so the sweep is
        // skipped entirely when the knob disables it.
        if self.idle.lock().unwrap().fired() {
            tracing::trace!("dispatcher idle tick");
            for id in self.container.connections() {
                self.kick(id);
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        let token = event.token();
        let kind = self.tokens.lock().unwrap().get(&token).copied();
        match kind {
            Some(TokenKind::Listener(idx)) => self.handle_accept(idx),
            Some(TokenKind::Connecting) => self.handle_connect_ready(token),
            Some(TokenKind::Conn(id)) => {
                if let Ok(comm) = self.container.get(id) {
                    if event.is_readable() {
                        comm.mark_readable();
                    }
                    if event.is_writable() {
                        comm.mark_writable();
                    }
                    self.kick(id);
                }
            }
            None => {}
        }
    }

    fn handle_accept(&self, idx: usize) {
        loop {
            let mut listeners = self.listeners.lock().unwrap();
            let Some(slot) = listeners.get_mut(idx) else { return };
            let stream_token = self.alloc_token();
            let accepted = slot.listener.try_accept(stream_token);
            let after_accept = slot.after_accept.clone();
            drop(listeners);

            match accepted {
                Ok(Some(mut stream)) => {
                    if let Some(hook) = after_accept.as_ref() {
                        hook(&stream);
                    }
                    if let Err(err) = stream.register(&self.registry) {
                        tracing::warn!(%err, "failed to register accepted stream");
                        continue;
                    }
                    let registry = match self.registry.try_clone() {
                        Ok(r) => r,
                        Err(err) => {
                            tracing::warn!(%err, "failed to clone registry for accepted stream");
                            continue;
                        }
                    };
                    let id = self.conn_ids.next();
                    let peer_addr = stream.peer_addr();
                    let comm = self.make_server_communicator(id, registry, peer_addr, stream);
                    self.container.insert(comm);
                    self.tokens.lock().unwrap().insert(stream_token, TokenKind::Conn(id));
                    self.kick(id);
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_connect_ready(&self, token: Token) {
        let pending = self.pending_connects.lock().unwrap().remove(&token);
        let Some(mut pending) = pending else { return };

        match pending.stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => {
                self.tokens.lock().unwrap().remove(&token);
                let _ = self.registry.deregister(&mut pending.stream);
                self.fire_connect_error(&err);
                if let Some(on_error) = pending.on_error {
                    on_error(err);
                }
                return;
            }
        }

        let registry = match self.registry.try_clone() {
            Ok(r) => r,
            Err(err) => {
                self.tokens.lock().unwrap().remove(&token);
                self.fire_connect_error(&err);
                if let Some(on_error) = pending.on_error {
                    on_error(err);
                }
                return;
            }
        };
        let stream = match TcpStream::from_connected(pending.stream, pending.peer_addr, token, &registry) {
            Ok(s) => s,
            Err(err) => {
                self.tokens.lock().unwrap().remove(&token);
                self.fire_connect_error(&err);
                if let Some(on_error) = pending.on_error {
                    on_error(err);
                }
                return;
            }
        };

        let id = self.conn_ids.next();
        #[cfg(feature = "tls")]
        let comm = self.make_client_communicator(id, registry, pending.peer_addr, stream, pending.server_name);
        #[cfg(not(feature = "tls"))]
        let comm = self.make_client_communicator(id, registry, pending.peer_addr, stream);
        self.container.insert(comm);
        self.tokens.lock().unwrap().insert(token, TokenKind::Conn(id));
        self.kick(id);
    }

    #[cfg(feature = "tls")]
    fn make_server_communicator(
        &self,
        id: ConnId,
        registry: mio::Registry,
        peer_addr: SocketAddr,
        stream: TcpStream,
    ) -> Arc<Communicator<C>> {
        let Some(server_config) = self.tls_server_config.clone() else {
            return Communicator::new_connected(id, Arc::clone(&self.config), registry, peer_addr, stream);
        };
        match conduit_net::tls::TlsSession::server(server_config) {
            Ok(tls) => Communicator::new_handshaking(id, Arc::clone(&self.config), registry, peer_addr, stream, tls),
            Err(err) => {
                tracing::warn!(%err, "failed to start TLS server handshake");
                Communicator::new_connected(id, Arc::clone(&self.config), registry, peer_addr, stream)
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    fn make_server_communicator(
        &self,
        id: ConnId,
        registry: mio::Registry,
        peer_addr: SocketAddr,
        stream: TcpStream,
    ) -> Arc<Communicator<C>> {
        Communicator::new_connected(id, Arc::clone(&self.config), registry, peer_addr, stream)
    }

    #[cfg(feature = "tls")]
    fn make_client_communicator(
        &self,
        id: ConnId,
        registry: mio::Registry,
        peer_addr: SocketAddr,
        stream: TcpStream,
        server_name: Option<rustls::pki_types::ServerName<'static>>,
    ) -> Arc<Communicator<C>> {
        let (Some(client_config), Some(server_name)) = (self.tls_client_config.clone(), server_name) else {
            return Communicator::new_connected(id, Arc::clone(&self.config), registry, peer_addr, stream);
        };
        match conduit_net::tls::TlsSession::client(client_config, server_name) {
            Ok(tls) => Communicator::new_handshaking(id, Arc::clone(&self.config), registry, peer_addr, stream, tls),
            Err(err) => {
                tracing::warn!(%err, "failed to start TLS client handshake");
                Communicator::new_connected(id, Arc::clone(&self.config), registry, peer_addr, stream)
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    fn make_client_communicator(
        &self,
        id: ConnId,
        registry: mio::Registry,
        peer_addr: SocketAddr,
        stream: TcpStream,
    ) -> Arc<Communicator<C>> {
        Communicator::new_connected(id, Arc::clone(&self.config), registry, peer_addr, stream)
    }

    fn drain_ready(&self) {
        loop {
            let id = self.ready_queue.lock().unwrap().pop_front();
            let Some(id) = id else { return };
            let _ = self
                .kick_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));

            let Some(comm) = self.container.take_out_id(id) else { continue };
            let outcome = comm.process();
            if outcome.should_erase {
                self.container.erase(id);
                self.tokens.lock().unwrap().retain(|_, kind| !matches!(kind, TokenKind::Conn(existing) if *existing == id));
            } else {
                self.container.get_back(id);
            }
        }
    }

    fn maybe_fire_after_round(&self) {
        if let Some(callback) = self.config.after_all_processed.as_ref() {
            callback();
        }
    }

    /// Notifies every broadcast subscriber registered via
    /// `ConfigBuilder::on_connect_error`, alongside (not instead of) the
    /// failed call's own one-shot `on_error` closure.
    fn fire_connect_error(&self, err: &io::Error) {
        for handler in &self.config.connect_error_handlers {
            handler(err);
        }
    }
}

#[cfg(feature = "tls")]
fn load_tls_configs(
    tls: Option<&crate::config::TlsConfig>,
) -> io::Result<(Option<Arc<rustls::ServerConfig>>, Option<Arc<rustls::ClientConfig>>)> {
    use conduit_net::tls::{ClientTrust, ServerIdentity, client_config, server_config};

    let Some(tls) = tls else { return Ok((None, None)) };

    let server = match (&tls.server_cert_chain_path, &tls.server_key_path) {
        (Some(chain_path), Some(key_path)) => {
            let identity = ServerIdentity {
                cert_chain_pem: std::fs::read(chain_path)?,
                private_key_pem: std::fs::read(key_path)?,
            };
            Some(server_config(identity).map_err(io::Error::other)?)
        }
        _ => None,
    };

    let client = match &tls.client_verify_ca_path {
        Some(ca_path) => {
            let trust = ClientTrust { ca_bundle_pem: std::fs::read(ca_path)? };
            Some(client_config(trust).map_err(io::Error::other)?)
        }
        None => None,
    };

    Ok((server, client))
}

impl<C: Codec> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.shutdown(Instant::now() + DROP_GRACE_PERIOD);
        }
        // Unconditional and blocking: guarantees no worker thread outlives
        // the dispatcher even if the graceful shutdown above timed out.
        self.running.store(false, Ordering::Release);
        self.work_cv.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(all(test, feature = "tls"))]
mod tls_config_tests {
    use std::io::Write;

    use super::load_tls_configs;
    use crate::config::TlsConfig;

    #[test]
    fn no_tls_config_loads_nothing() {
        let (server, client) = load_tls_configs(None).unwrap();
        assert!(server.is_none());
        assert!(client.is_none());
    }

    #[test]
    fn missing_cert_file_surfaces_as_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let tls = TlsConfig {
            server_cert_chain_path: Some(dir.path().join("does-not-exist.pem")),
            server_key_path: Some(dir.path().join("does-not-exist.key")),
            client_verify_ca_path: None,
        };
        let err = load_tls_configs(Some(&tls)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn malformed_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let chain_path = dir.path().join("chain.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::File::create(&chain_path).unwrap().write_all(b"not a certificate").unwrap();
        std::fs::File::create(&key_path).unwrap().write_all(b"not a key").unwrap();

        let tls = TlsConfig {
            server_cert_chain_path: Some(chain_path),
            server_key_path: Some(key_path),
            client_verify_ca_path: None,
        };
        assert!(load_tls_configs(Some(&tls)).is_err());
    }

    #[test]
    fn client_trust_reads_ca_bundle_path() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        std::fs::File::create(&ca_path).unwrap().write_all(b"not a cert either").unwrap();

        let tls = TlsConfig {
            server_cert_chain_path: None,
            server_key_path: None,
            client_verify_ca_path: Some(ca_path),
        };
        // rustls_pemfile::certs() silently skips non-PEM content rather than
        // erroring, so an empty (but readable) root store is the expected
        // outcome here rather than a load failure.
        let (server, client) = load_tls_configs(Some(&tls)).unwrap();
        assert!(server.is_none());
        assert!(client.is_some());
    }
}

use std::{
    collections::BinaryHeap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use conduit_net::tcp::{ConnState, TcpStream};

use crate::{
    codec::Codec,
    config::Config,
    error::{Error, HandlerError},
    ids::{ConnId, MsgId, MsgIdGenerator},
    message::{Message, PreparedMessage, SentRecord},
    session::{Arrived, ConnHandle, ConnOps, Session},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommState {
    Disconnected,
    Handshaking,
    Connected,
    TearingDown,
}

struct ConnIo {
    stream: TcpStream,
    in_buf: Vec<u8>,
    #[cfg(feature = "tls")]
    tls: Option<conduit_net::tls::TlsSession>,
}

struct PendingSend<M> {
    message: M,
    on_sent: Option<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct ProcessOutcome {
    pub(crate) should_erase: bool,
}

/// Per-connection state machine and I/O executor. Never processed by more
/// than one worker at a time — `Container::take_out` is what enforces that;
/// this type itself only guarantees that its own fields are individually
/// consistent under concurrent access (e.g. `send`/`disconnect` called from
/// application code on another thread while a worker is mid-`process`).
pub struct Communicator<C: Codec> {
    id: ConnId,
    config: Arc<Config<C>>,
    registry: mio::Registry,
    peer_addr: SocketAddr,

    state: Mutex<CommState>,
    io: Mutex<Option<ConnIo>>,
    session: Mutex<Option<C::Session>>,

    send_inbox: Mutex<Vec<PendingSend<C::Message>>>,
    out_queue: Mutex<BinaryHeap<PreparedMessage>>,
    sent_records: Mutex<Vec<SentRecord>>,
    timeouts: Mutex<crate::timeout::TimeoutMap>,

    read_error: Mutex<Option<std::io::Error>>,
    write_error: Mutex<Option<std::io::Error>>,
    #[cfg(feature = "tls")]
    handshake_error: Mutex<Option<std::io::Error>>,

    just_connected: AtomicBool,
    in_buffer_updated: AtomicBool,
    pending_readable: AtomicBool,
    pending_writable: AtomicBool,

    msg_ids: MsgIdGenerator,
    seq: AtomicU64,
}

impl<C: Codec> Communicator<C> {
    fn new(
        id: ConnId,
        config: Arc<Config<C>>,
        registry: mio::Registry,
        peer_addr: SocketAddr,
        io: Option<ConnIo>,
        state: CommState,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            registry,
            peer_addr,
            state: Mutex::new(state),
            io: Mutex::new(io),
            session: Mutex::new(None),
            send_inbox: Mutex::new(Vec::new()),
            out_queue: Mutex::new(BinaryHeap::new()),
            sent_records: Mutex::new(Vec::new()),
            timeouts: Mutex::new(crate::timeout::TimeoutMap::default()),
            read_error: Mutex::new(None),
            write_error: Mutex::new(None),
            #[cfg(feature = "tls")]
            handshake_error: Mutex::new(None),
            just_connected: AtomicBool::new(false),
            in_buffer_updated: AtomicBool::new(false),
            pending_readable: AtomicBool::new(false),
            pending_writable: AtomicBool::new(false),
            msg_ids: MsgIdGenerator::default(),
            seq: AtomicU64::new(0),
        })
    }

    /// Constructs a communicator already past the handshake (plaintext TCP,
    /// or TLS disabled at the crate level).
    pub(crate) fn new_connected(
        id: ConnId,
        config: Arc<Config<C>>,
        registry: mio::Registry,
        peer_addr: SocketAddr,
        stream: TcpStream,
    ) -> Arc<Self> {
        let io = ConnIo {
            stream,
            in_buf: Vec::new(),
            #[cfg(feature = "tls")]
            tls: None,
        };
        let comm = Self::new(id, config, registry, peer_addr, Some(io), CommState::Connected);
        comm.just_connected.store(true, Ordering::Release);
        comm
    }

    #[cfg(feature = "tls")]
    pub(crate) fn new_handshaking(
        id: ConnId,
        config: Arc<Config<C>>,
        registry: mio::Registry,
        peer_addr: SocketAddr,
        stream: TcpStream,
        tls: conduit_net::tls::TlsSession,
    ) -> Arc<Self> {
        let io = ConnIo { stream, in_buf: Vec::new(), tls: Some(tls) };
        Self::new(id, config, registry, peer_addr, Some(io), CommState::Handshaking)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_endpoint(&self) -> std::io::Result<SocketAddr> {
        let guard = self.io.lock().unwrap();
        guard
            .as_ref()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))
            .and_then(|io| io.stream.local_addr())
    }

    pub fn config(&self) -> &Config<C> {
        &self.config
    }

    pub fn new_mid(&self) -> MsgId {
        self.msg_ids.next()
    }

    pub fn is_session_valid(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    pub fn with_session<R>(&self, f: impl FnOnce(Option<&mut C::Session>) -> R) -> R {
        let mut guard = self.session.lock().unwrap();
        f(guard.as_mut())
    }

    pub fn send(&self, message: C::Message) -> MsgId {
        self.enqueue_send(message, None)
    }

    pub fn send_with(&self, message: C::Message, on_sent: impl FnOnce() + Send + 'static) -> MsgId {
        self.enqueue_send(message, Some(Box::new(on_sent)))
    }

    /// Always defers to the inbox — called from application code or
    /// reentrantly from within a session handler, it never touches the
    /// session lock, so it can't deadlock against a handler invocation that
    /// already holds it. The message is actually encoded and queued for
    /// writing on a later pass through `process()` (see `flush_outbound`).
    fn enqueue_send(&self, mut message: C::Message, on_sent: Option<Box<dyn FnOnce() + Send>>) -> MsgId {
        if self.config.use_unique_message_id && !message.id().is_defined() {
            message.set_id(self.msg_ids.next());
        }
        let id = message.id();
        self.send_inbox.lock().unwrap().push(PendingSend { message, on_sent });
        id
    }

    /// Idempotent, no-throw orderly shutdown.
    pub fn disconnect(&self) {
        let conn = ConnHandle { ops: self };
        self.teardown(&conn);
    }

    pub(crate) fn mark_readable(&self) {
        self.pending_readable.store(true, Ordering::Release);
    }

    pub(crate) fn mark_writable(&self) {
        self.pending_writable.store(true, Ordering::Release);
    }

    pub(crate) fn process(&self) -> ProcessOutcome {
        let conn = ConnHandle { ops: self };

        let state = *self.state.lock().unwrap();
        if matches!(state, CommState::Disconnected | CommState::TearingDown) {
            return ProcessOutcome { should_erase: true };
        }

        #[cfg(feature = "tls")]
        if state == CommState::Handshaking {
            self.pump_tls_handshake();
            if self.drain_error_latches(&conn) {
                return ProcessOutcome { should_erase: true };
            }
            return ProcessOutcome { should_erase: false };
        }

        // Step 1: connected event + implicit read arm (already registered
        // at construction time).
        if self.just_connected.swap(false, Ordering::AcqRel) {
            if self.session.lock().unwrap().is_none() {
                match (self.config.session_factory)() {
                    Ok(session) => *self.session.lock().unwrap() = Some(session),
                    Err(err) => {
                        let err = Error::SessionCreation(self.id, err);
                        tracing::error!(%err, "session construction failed, tearing down with no connected/disconnected pair");
                        self.close_socket();
                        *self.state.lock().unwrap() = CommState::Disconnected;
                        return ProcessOutcome { should_erase: true };
                    }
                }
            }
            self.call_on_connected(&conn);
        }

        // Step 2: drain sent records queued on a previous tick's write loop.
        self.drain_sent_records(&conn);

        // Non-blocking socket pump: our mio realisation of the async
        // read/write completions the spec describes as arriving via
        // reactor callbacks.
        self.pump_io();

        // Step 3: decode loop, bounded by the incoming quantum.
        if self.in_buffer_updated.swap(false, Ordering::AcqRel) {
            self.run_decode_loop(&conn);
        }

        // Step 4: write issue loop, bounded by the outgoing quantum.
        self.run_write_loop();

        // Step 5: timeout sweep.
        if self.config.timeouts_enabled {
            self.run_timeout_sweep(&conn);
        }

        // Step 6: error latches.
        if self.drain_error_latches(&conn) {
            return ProcessOutcome { should_erase: true };
        }

        // Step 7: after-processed.
        self.call_on_after_processed(&conn);

        ProcessOutcome { should_erase: false }
    }

    fn pump_io(&self) {
        let readable = self.pending_readable.swap(false, Ordering::AcqRel);
        let writable = self.pending_writable.swap(false, Ordering::AcqRel);
        if !readable && !writable {
            return;
        }

        let mut io_guard = self.io.lock().unwrap();
        let Some(io) = io_guard.as_mut() else { return };

        #[cfg(feature = "tls")]
        if let Some(tls) = io.tls.as_mut() {
            if let conduit_net::tls::HandshakeStatus::Failed(err) = tls.advance(io.stream.raw()) {
                drop(io_guard);
                *self.read_error.lock().unwrap() = Some(err);
                return;
            }
            let mut scratch = [0u8; 16 * 1024];
            loop {
                match tls.read_plaintext(&mut scratch) {
                    Ok(0) => break,
                    Ok(n) => {
                        io.in_buf.extend_from_slice(&scratch[..n]);
                        self.in_buffer_updated.store(true, Ordering::Release);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
            return;
        }

        if readable {
            match io.stream.read_into(&mut io.in_buf) {
                ConnState::Alive => self.in_buffer_updated.store(true, Ordering::Release),
                ConnState::Disconnected => {
                    drop(io_guard);
                    *self.read_error.lock().unwrap() =
                        Some(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
                    return;
                }
            }
        }
        if writable && io.stream.drain_backlog(&self.registry) == ConnState::Disconnected {
            drop(io_guard);
            *self.write_error.lock().unwrap() = Some(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        }
    }

    #[cfg(feature = "tls")]
    fn pump_tls_handshake(&self) {
        let mut io_guard = self.io.lock().unwrap();
        let Some(io) = io_guard.as_mut() else { return };
        let Some(tls) = io.tls.as_mut() else { return };
        match tls.advance(io.stream.raw()) {
            conduit_net::tls::HandshakeStatus::InProgress => {}
            conduit_net::tls::HandshakeStatus::Complete => {
                drop(io_guard);
                *self.state.lock().unwrap() = CommState::Connected;
                self.just_connected.store(true, Ordering::Release);
            }
            conduit_net::tls::HandshakeStatus::Failed(err) => {
                drop(io_guard);
                *self.handshake_error.lock().unwrap() = Some(err);
            }
        }
    }

    fn drain_sent_records(&self, conn: &ConnHandle<'_, C::Message>) {
        let records: Vec<SentRecord> = std::mem::take(&mut *self.sent_records.lock().unwrap());
        for record in records {
            if self.config.timeouts_enabled {
                let info = self.config.message_info.lookup(&record.name);
                if info.needs_reply {
                    if let Some(timeout) = info.timeout.or(self.config.default_timeout) {
                        self.timeouts.lock().unwrap().insert(
                            record.app_id,
                            record.name.clone(),
                            Instant::now() + timeout,
                        );
                    }
                }
            }
            if let Some(cb) = record.on_sent {
                cb();
            }
            self.call_on_sent(conn, &record.name, record.app_id);
        }
    }

    /// Moves anything waiting in the send inbox into the priority out-queue,
    /// stamping ids/priority defaults and invoking the codec's encoder. Runs
    /// only from within `process()`, never reentrantly from a handler, so
    /// locking the session here is always deadlock-free.
    fn flush_outbound(&self) {
        let pending: Vec<PendingSend<C::Message>> = std::mem::take(&mut *self.send_inbox.lock().unwrap());
        if pending.is_empty() {
            return;
        }
        let session_guard = self.session.lock().unwrap();
        let Some(session) = session_guard.as_ref() else {
            drop(session_guard);
            self.send_inbox.lock().unwrap().extend(pending);
            return;
        };

        let mut out_queue = self.out_queue.lock().unwrap();
        for PendingSend { mut message, on_sent } in pending {
            let info = self.config.message_info.lookup(message.name());
            if self.config.use_default_message_priority && !message.priority().is_defined() {
                let priority = if info.default_priority.is_defined() {
                    info.default_priority
                } else {
                    self.config.default_priority
                };
                message.set_priority(priority);
            }
            let app_id = message.id();
            let name = message.name().to_string();
            let priority = message.priority();
            let bytes = self.config.codec.encode(&message, session);
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            out_queue.push(PreparedMessage { seq, app_id, name, priority, bytes, on_sent });
        }
    }

    fn run_write_loop(&self) {
        self.flush_outbound();

        let deadline = Instant::now() + self.config.outgoing_quantum;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            let Some(prepared) = self.out_queue.lock().unwrap().pop() else { break };

            let mut io_guard = self.io.lock().unwrap();
            let Some(io) = io_guard.as_mut() else { break };

            #[cfg(feature = "tls")]
            let state = if let Some(tls) = io.tls.as_mut() {
                match tls.write_plaintext(&prepared.bytes) {
                    Ok(_) => match tls.advance(io.stream.raw()) {
                        conduit_net::tls::HandshakeStatus::Failed(_) => ConnState::Disconnected,
                        _ => ConnState::Alive,
                    },
                    Err(_) => ConnState::Disconnected,
                }
            } else {
                io.stream.write_or_enqueue(&self.registry, prepared.bytes.clone())
            };
            #[cfg(not(feature = "tls"))]
            let state = io.stream.write_or_enqueue(&self.registry, prepared.bytes.clone());

            drop(io_guard);

            match state {
                ConnState::Alive => {
                    self.sent_records.lock().unwrap().push(SentRecord {
                        app_id: prepared.app_id,
                        name: prepared.name,
                        on_sent: prepared.on_sent,
                    });
                }
                ConnState::Disconnected => {
                    *self.write_error.lock().unwrap() =
                        Some(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
                    break;
                }
            }
        }
    }

    fn run_decode_loop(&self, conn: &ConnHandle<'_, C::Message>) {
        let deadline = Instant::now() + self.config.incoming_quantum;
        loop {
            if Instant::now() >= deadline {
                break;
            }

            let mut io_guard = self.io.lock().unwrap();
            let Some(io) = io_guard.as_mut() else { break };

            let decoded = {
                let mut session_guard = self.session.lock().unwrap();
                let Some(session) = session_guard.as_mut() else { break };
                self.config.codec.decode(&io.in_buf, session)
            };

            match decoded {
                Ok(None) => break,
                Ok(Some((message, consumed))) => {
                    io.in_buf.drain(..consumed);
                    drop(io_guard);
                    self.handle_decoded_message(conn, message);
                }
                Err(err) => {
                    drop(io_guard);
                    self.call_on_error(conn, &Error::Decode(self.id, Box::new(err)));
                    break;
                }
            }
        }
    }

    fn handle_decoded_message(&self, conn: &ConnHandle<'_, C::Message>, message: C::Message) {
        if message.reply_id().is_defined() {
            self.handle_reply(conn, message);
        } else {
            self.handle_request(conn, message);
        }
    }

    fn handle_request(&self, conn: &ConnHandle<'_, C::Message>, message: C::Message) {
        let request_id = message.id();
        let pre_allocated = self.msg_ids.next();
        self.dispatch_arrived(conn, message, move |outbound| {
            outbound.set_reply_id(request_id);
            if !outbound.id().is_defined() {
                outbound.set_id(pre_allocated);
            }
        });
    }

    fn handle_reply(&self, conn: &ConnHandle<'_, C::Message>, message: C::Message) {
        let reply_id = message.reply_id();
        let Some(entry) = self.timeouts.lock().unwrap().remove(reply_id) else {
            tracing::debug!(conn = self.id.as_u64(), reply_id = reply_id.as_u64(), "discarding late or unknown reply");
            return;
        };

        let request_info = self.config.message_info.lookup(&entry.name);
        if !request_info.allows_reply(message.name()) {
            let reply_name = message.name().to_string();
            let request_name = entry.name.clone();
            // The request's timeout keeps running: a disallowed reply is
            // not a valid correlation event.
            self.timeouts.lock().unwrap().insert(reply_id, entry.name, entry.deadline);
            self.call_on_error(
                conn,
                &Error::DisallowedReply { conn: self.id, request: request_name, reply: reply_name },
            );
            return;
        }

        let this_id = message.id();
        self.dispatch_arrived(conn, message, move |outbound| {
            outbound.set_reply_id(this_id);
        });
    }

    fn dispatch_arrived(
        &self,
        conn: &ConnHandle<'_, C::Message>,
        message: C::Message,
        stamp: impl FnOnce(&mut C::Message),
    ) {
        let mut arrived = Arrived::new(message);
        {
            let mut guard = self.session.lock().unwrap();
            let Some(session) = guard.as_mut() else { return };
            match session.on_arrived(conn, &mut arrived) {
                Ok(()) => {}
                Err(HandlerError::Disconnect) => {
                    drop(guard);
                    self.disconnect();
                    return;
                }
                Err(HandlerError::Other(err)) => {
                    drop(guard);
                    self.call_on_error(conn, &Error::Communication(self.id, std::io::Error::other(err)));
                    return;
                }
            }
        }
        if let Some((mut outbound, on_sent)) = arrived.outbound.take() {
            stamp(&mut outbound);
            self.enqueue_send(outbound, on_sent);
        }
    }

    fn run_timeout_sweep(&self, conn: &ConnHandle<'_, C::Message>) {
        let expired = self.timeouts.lock().unwrap().drain_expired(Instant::now());
        for (id, entry) in expired {
            self.call_on_timeout(conn, &entry.name, id);
        }
    }

    fn drain_error_latches(&self, conn: &ConnHandle<'_, C::Message>) -> bool {
        let err = self
            .read_error
            .lock()
            .unwrap()
            .take()
            .or_else(|| self.write_error.lock().unwrap().take())
            .or_else(|| self.handshake_error_opt());
        let Some(err) = err else { return false };

        if is_disconnect_class(&err) {
            self.teardown(conn);
            true
        } else {
            self.call_on_error(conn, &Error::Communication(self.id, err));
            false
        }
    }

    #[cfg(feature = "tls")]
    fn handshake_error_opt(&self) -> Option<std::io::Error> {
        self.handshake_error.lock().unwrap().take()
    }

    #[cfg(not(feature = "tls"))]
    fn handshake_error_opt(&self) -> Option<std::io::Error> {
        None
    }

    fn teardown(&self, conn: &ConnHandle<'_, C::Message>) {
        let already_done = {
            let mut state = self.state.lock().unwrap();
            let done = matches!(*state, CommState::TearingDown | CommState::Disconnected);
            if !done {
                *state = CommState::TearingDown;
            }
            done
        };
        if already_done {
            return;
        }

        self.close_socket();
        self.timeouts.lock().unwrap().clear();

        let had_session = self.session.lock().unwrap().is_some();
        if had_session {
            self.call_on_disconnected(conn);
        }

        *self.state.lock().unwrap() = CommState::Disconnected;
    }

    fn close_socket(&self) {
        let mut io_guard = self.io.lock().unwrap();
        if let Some(io) = io_guard.as_mut() {
            io.stream.close(&self.registry);
        }
        *io_guard = None;
    }

    fn call_on_connected(&self, conn: &ConnHandle<'_, C::Message>) {
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else { return };
        match session.on_connected(conn) {
            Ok(()) => {}
            Err(HandlerError::Disconnect) => {
                drop(guard);
                self.disconnect();
            }
            Err(HandlerError::Other(err)) => {
                drop(guard);
                self.call_on_error(conn, &Error::Communication(self.id, std::io::Error::other(err)));
            }
        }
    }

    fn call_on_sent(&self, conn: &ConnHandle<'_, C::Message>, name: &str, id: MsgId) {
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else { return };
        match session.on_sent(conn, name, id) {
            Ok(()) => {}
            Err(HandlerError::Disconnect) => {
                drop(guard);
                self.disconnect();
            }
            Err(HandlerError::Other(err)) => {
                drop(guard);
                self.call_on_error(conn, &Error::Communication(self.id, std::io::Error::other(err)));
            }
        }
    }

    fn call_on_timeout(&self, conn: &ConnHandle<'_, C::Message>, name: &str, id: MsgId) {
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else { return };
        match session.on_timeout(conn, name, id) {
            Ok(()) => {}
            Err(HandlerError::Disconnect) => {
                drop(guard);
                self.disconnect();
            }
            Err(HandlerError::Other(err)) => {
                drop(guard);
                self.call_on_error(conn, &Error::Communication(self.id, std::io::Error::other(err)));
            }
        }
    }

    fn call_on_after_processed(&self, conn: &ConnHandle<'_, C::Message>) {
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else { return };
        match session.on_after_processed(conn) {
            Ok(()) => {}
            Err(HandlerError::Disconnect) => {
                drop(guard);
                self.disconnect();
            }
            Err(HandlerError::Other(err)) => {
                drop(guard);
                self.call_on_error(conn, &Error::Communication(self.id, std::io::Error::other(err)));
            }
        }
    }

    /// `error` may not throw: a panicking implementation is a contract
    /// violation, not a recoverable outcome.
    fn call_on_error(&self, conn: &ConnHandle<'_, C::Message>, err: &Error) {
        tracing::warn!(conn = self.id.as_u64(), %err, "communicator error");
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else { return };
        let panicked =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| session.on_error(conn, err))).is_err();
        if panicked {
            conduit_support::safe_panic!("session on_error handler panicked; this event must not throw");
        }
    }

    /// `disconnected` may not throw and fires at most once per session.
    fn call_on_disconnected(&self, conn: &ConnHandle<'_, C::Message>) {
        let mut guard = self.session.lock().unwrap();
        let Some(session) = guard.as_mut() else { return };
        let panicked =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| session.on_disconnected(conn))).is_err();
        if panicked {
            conduit_support::safe_panic!("session on_disconnected handler panicked; this event must not throw");
        }
    }
}

impl<C: Codec> ConnOps<C::Message> for Communicator<C> {
    fn id(&self) -> ConnId {
        self.id
    }

    fn remote_endpoint(&self) -> SocketAddr {
        self.peer_addr
    }

    fn send(&self, message: C::Message) -> MsgId {
        Communicator::send(self, message)
    }

    fn send_boxed(&self, message: C::Message, on_sent: Box<dyn FnOnce() + Send>) -> MsgId {
        self.enqueue_send(message, Some(on_sent))
    }

    fn disconnect(&self) {
        Communicator::disconnect(self);
    }
}

fn is_disconnect_class(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), UnexpectedEof | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe)
}

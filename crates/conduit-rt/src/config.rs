use std::{io, time::Duration};

use crate::{codec::Codec, error::Error, message_info::MessageRegistry, priority::Priority};

pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(100);

/// Default `dispatcher_idle_tout`: the periodic sweep that gives every live
/// connection a `process()` tick even without fresh socket readiness, so
/// reply timeouts and application-initiated sends aren't starved on an
/// otherwise-quiet connection. `Duration::ZERO` disables the sweep outright.
pub const DEFAULT_DISPATCHER_IDLE_TOUT: Duration = Duration::from_millis(50);

/// PEM-encoded TLS material, read from the paths named here. Only the
/// chain/key pair (server identity) and CA bundle (client trust) are
/// supported: `rustls` has no equivalent of OpenSSL's encrypted-private-key
/// or custom-DH-parameters knobs (TLS 1.3 negotiates ephemeral key exchange
/// per cipher suite rather than loading static DH parameters from a file),
/// so those two options from the original configuration surface have no
/// realisation here.
#[cfg(feature = "tls")]
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub server_cert_chain_path: Option<std::path::PathBuf>,
    pub server_key_path: Option<std::path::PathBuf>,
    pub client_verify_ca_path: Option<std::path::PathBuf>,
}

/// Immutable runtime configuration, assembled by [`ConfigBuilder`]. Shared
/// (via `Arc`) between the dispatcher and every communicator it owns.
pub struct Config<C: Codec> {
    pub tcp_backlog: u32,
    pub default_timeout: Option<Duration>,
    pub default_priority: Priority,
    pub timeouts_enabled: bool,
    pub use_unique_message_id: bool,
    pub use_default_message_priority: bool,
    pub dispatcher_idle_tout: Duration,
    pub incoming_quantum: Duration,
    pub outgoing_quantum: Duration,
    pub worker_threads: usize,
    pub message_info: MessageRegistry,
    pub socket_buf_size: Option<usize>,
    pub codec: C,
    #[allow(clippy::type_complexity)]
    pub session_factory:
        Box<dyn Fn() -> Result<C::Session, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>,
    /// Called once at the end of each dispatcher round that drained the
    /// ready queue, regardless of whether that round did any real work.
    pub after_all_processed: Option<Box<dyn Fn() + Send + Sync>>,
    /// Broadcast subscribers notified on every failed `connect`/`connect_tls`
    /// attempt, alongside (not instead of) that call's own one-shot
    /// `on_error` closure.
    pub connect_error_handlers: Vec<Box<dyn Fn(&io::Error) + Send + Sync>>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsConfig>,
}

pub struct ConfigBuilder<C: Codec> {
    tcp_backlog: u32,
    default_timeout: Option<Duration>,
    default_priority: Priority,
    timeouts_enabled: bool,
    use_unique_message_id: bool,
    use_default_message_priority: bool,
    dispatcher_idle_tout: Duration,
    incoming_quantum: Duration,
    outgoing_quantum: Duration,
    worker_threads: usize,
    message_info: MessageRegistry,
    socket_buf_size: Option<usize>,
    codec: Option<C>,
    #[allow(clippy::type_complexity)]
    session_factory:
        Option<Box<dyn Fn() -> Result<C::Session, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>>,
    after_all_processed: Option<Box<dyn Fn() + Send + Sync>>,
    connect_error_handlers: Vec<Box<dyn Fn(&io::Error) + Send + Sync>>,
    #[cfg(feature = "tls")]
    tls: Option<TlsConfig>,
}

impl<C: Codec> Default for ConfigBuilder<C> {
    fn default() -> Self {
        Self {
            tcp_backlog: 0,
            default_timeout: None,
            default_priority: Priority::UNDEFINED,
            timeouts_enabled: false,
            use_unique_message_id: false,
            use_default_message_priority: false,
            dispatcher_idle_tout: DEFAULT_DISPATCHER_IDLE_TOUT,
            incoming_quantum: DEFAULT_QUANTUM,
            outgoing_quantum: DEFAULT_QUANTUM,
            worker_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            message_info: MessageRegistry::default(),
            socket_buf_size: None,
            codec: None,
            session_factory: None,
            after_all_processed: None,
            connect_error_handlers: Vec::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl<C: Codec> ConfigBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tcp_backlog(mut self, value: u32) -> Self {
        self.tcp_backlog = value;
        self
    }

    pub fn default_timeout(mut self, value: Duration) -> Self {
        self.default_timeout = Some(value);
        self
    }

    pub fn default_priority(mut self, value: Priority) -> Self {
        self.default_priority = value;
        self
    }

    pub fn timeouts_enabled(mut self, value: bool) -> Self {
        self.timeouts_enabled = value;
        self
    }

    pub fn use_unique_message_id(mut self, value: bool) -> Self {
        self.use_unique_message_id = value;
        self
    }

    pub fn use_default_message_priority(mut self, value: bool) -> Self {
        self.use_default_message_priority = value;
        self
    }

    /// Defaults to [`DEFAULT_DISPATCHER_IDLE_TOUT`]. `Duration::ZERO`
    /// disables the idle timer outright (the dispatcher never arms it) — the
    /// original library's own documentation for this knob reads "zero is
    /// infinite timeout".
    pub fn dispatcher_idle_tout(mut self, value: Duration) -> Self {
        self.dispatcher_idle_tout = value;
        self
    }

    pub fn incoming_quantum(mut self, value: Duration) -> Self {
        self.incoming_quantum = value;
        self
    }

    pub fn outgoing_quantum(mut self, value: Duration) -> Self {
        self.outgoing_quantum = value;
        self
    }

    /// Defaults to the detected core count. Zero is rejected at `build()`
    /// time by clamping to one — a dispatcher needs at least one worker.
    pub fn worker_threads(mut self, value: usize) -> Self {
        self.worker_threads = value;
        self
    }

    pub fn message_info(mut self, info: crate::message_info::MessageInfo) -> Self {
        self.message_info.insert(info);
        self
    }

    pub fn socket_buf_size(mut self, value: usize) -> Self {
        self.socket_buf_size = Some(value);
        self
    }

    pub fn codec(mut self, codec: C) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn session_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<C::Session, Box<dyn std::error::Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.session_factory = Some(Box::new(factory));
        self
    }

    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn after_all_processed<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.after_all_processed = Some(Box::new(f));
        self
    }

    /// Registers a broadcast connect-error handler: fires on every failed
    /// `connect`/`connect_tls` attempt dispatcher-wide, alongside (not
    /// instead of) that attempt's own one-shot `on_error` closure. May be
    /// called more than once to register several independent subscribers.
    pub fn on_connect_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&io::Error) + Send + Sync + 'static,
    {
        self.connect_error_handlers.push(Box::new(handler));
        self
    }

    pub fn build(self) -> Result<Config<C>, Error> {
        let codec = self.codec.ok_or(Error::InvalidSessionFactory)?;
        let session_factory = self.session_factory.ok_or(Error::InvalidSessionFactory)?;
        Ok(Config {
            tcp_backlog: self.tcp_backlog,
            default_timeout: self.default_timeout,
            default_priority: self.default_priority,
            timeouts_enabled: self.timeouts_enabled,
            use_unique_message_id: self.use_unique_message_id,
            use_default_message_priority: self.use_default_message_priority,
            dispatcher_idle_tout: self.dispatcher_idle_tout,
            incoming_quantum: self.incoming_quantum,
            outgoing_quantum: self.outgoing_quantum,
            worker_threads: self.worker_threads.max(1),
            message_info: self.message_info,
            socket_buf_size: self.socket_buf_size,
            codec,
            session_factory,
            after_all_processed: self.after_all_processed,
            connect_error_handlers: self.connect_error_handlers,
            #[cfg(feature = "tls")]
            tls: self.tls,
        })
    }
}

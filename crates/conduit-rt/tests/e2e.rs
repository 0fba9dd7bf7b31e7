//! End-to-end scenarios driving two dispatchers (client/server) over real
//! loopback sockets with a minimal line-oriented codec.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use conduit_rt::{
    Codec, Config, ConfigBuilder, ConnHandle, Error, HandlerResult, Message, MessageInfo, MsgId, Priority, Session,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

fn local_addr() -> SocketAddr {
    SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
}

fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

// ---- line codec: "name\x01id\x01reply_id\x01priority\x01payload\n" -------

#[derive(Debug, Clone, Default)]
struct LineMessage {
    name: String,
    id: MsgId,
    reply_id: MsgId,
    priority: Priority,
    payload: String,
}

impl LineMessage {
    fn new(name: &str, payload: &str) -> Self {
        Self { name: name.to_string(), payload: payload.to_string(), ..Self::default() }
    }
}

impl Message for LineMessage {
    fn name(&self) -> &str {
        &self.name
    }
    fn id(&self) -> MsgId {
        self.id
    }
    fn set_id(&mut self, id: MsgId) {
        self.id = id;
    }
    fn reply_id(&self) -> MsgId {
        self.reply_id
    }
    fn set_reply_id(&mut self, id: MsgId) {
        self.reply_id = id;
    }
    fn priority(&self) -> Priority {
        self.priority
    }
    fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }
}

#[derive(Debug, thiserror::Error)]
enum LineCodecError {
    #[error("malformed frame")]
    Malformed,
}

struct LineCodec;

impl Codec for LineCodec {
    type Message = LineMessage;
    type Session = EventLog;
    type Error = LineCodecError;

    fn decode(
        &self,
        buf: &[u8],
        _session: &mut Self::Session,
    ) -> Result<Option<(Self::Message, usize)>, Self::Error> {
        let Some(nl) = buf.iter().position(|&b| b == b'\n') else { return Ok(None) };
        let line = std::str::from_utf8(&buf[..nl]).map_err(|_| LineCodecError::Malformed)?;
        let mut parts = line.split('\x01');
        let name = parts.next().ok_or(LineCodecError::Malformed)?.to_string();
        let id: u64 = parts.next().ok_or(LineCodecError::Malformed)?.parse().map_err(|_| LineCodecError::Malformed)?;
        let reply_id: u64 =
            parts.next().ok_or(LineCodecError::Malformed)?.parse().map_err(|_| LineCodecError::Malformed)?;
        let priority: i32 =
            parts.next().ok_or(LineCodecError::Malformed)?.parse().map_err(|_| LineCodecError::Malformed)?;
        let payload = parts.next().unwrap_or("").to_string();
        Ok(Some((
            LineMessage {
                name,
                id: MsgId::from_u64(id),
                reply_id: MsgId::from_u64(reply_id),
                priority: Priority::new(priority),
                payload,
            },
            nl + 1,
        )))
    }

    fn encode(&self, message: &Self::Message, _session: &Self::Session) -> Vec<u8> {
        format!(
            "{}\x01{}\x01{}\x01{}\x01{}\n",
            message.name,
            message.id.as_u64(),
            message.reply_id.as_u64(),
            message.priority.get(),
            message.payload
        )
        .into_bytes()
    }
}

// ---- session: records every event for test assertions ---------------------

#[derive(Debug, Clone)]
enum Event {
    Connected,
    Arrived { name: String, id: u64, reply_id: u64, payload: String },
    Sent { name: String, id: u64 },
    Timeout { name: String, id: u64 },
    Disconnected,
    Error(String),
}

#[derive(Default)]
struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
    reply_with: Option<&'static str>,
}

impl EventLog {
    fn shared(reply_with: Option<&'static str>) -> (Arc<Mutex<Vec<Event>>>, impl Fn() -> Result<EventLog, Box<dyn std::error::Error + Send + Sync>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        (events, move || Ok(EventLog { events: captured.clone(), reply_with }))
    }
}

impl Session for EventLog {
    type Message = LineMessage;

    fn on_connected(&mut self, _conn: &ConnHandle<'_, LineMessage>) -> HandlerResult {
        self.events.lock().unwrap().push(Event::Connected);
        Ok(())
    }

    fn on_arrived(
        &mut self,
        _conn: &ConnHandle<'_, LineMessage>,
        arrived: &mut conduit_rt::Arrived<LineMessage>,
    ) -> HandlerResult {
        let m = &arrived.message;
        self.events.lock().unwrap().push(Event::Arrived {
            name: m.name.clone(),
            id: m.id.as_u64(),
            reply_id: m.reply_id.as_u64(),
            payload: m.payload.clone(),
        });
        if let Some(reply_name) = self.reply_with {
            arrived.reply(LineMessage::new(reply_name, &m.payload));
        }
        Ok(())
    }

    fn on_sent(&mut self, _conn: &ConnHandle<'_, LineMessage>, name: &str, id: MsgId) -> HandlerResult {
        self.events.lock().unwrap().push(Event::Sent { name: name.to_string(), id: id.as_u64() });
        Ok(())
    }

    fn on_timeout(&mut self, _conn: &ConnHandle<'_, LineMessage>, name: &str, id: MsgId) -> HandlerResult {
        self.events.lock().unwrap().push(Event::Timeout { name: name.to_string(), id: id.as_u64() });
        Ok(())
    }

    fn on_disconnected(&mut self, _conn: &ConnHandle<'_, LineMessage>) {
        self.events.lock().unwrap().push(Event::Disconnected);
    }

    fn on_error(&mut self, _conn: &ConnHandle<'_, LineMessage>, err: &Error) {
        self.events.lock().unwrap().push(Event::Error(err.to_string()));
    }
}

fn config_with(reply_with: Option<&'static str>, timeouts: bool) -> (Arc<Mutex<Vec<Event>>>, Config<LineCodec>) {
    let (events, factory) = EventLog::shared(reply_with);
    let config = ConfigBuilder::<LineCodec>::new()
        .codec(LineCodec)
        .session_factory(factory)
        .timeouts_enabled(timeouts)
        .use_unique_message_id(true)
        .use_default_message_priority(true)
        .default_timeout(Duration::from_millis(400))
        .message_info(MessageInfo::new("ping").needs_reply(true).allowed_replies(["pong"]).timeout(Duration::from_millis(400)))
        .worker_threads(2)
        .build()
        .unwrap();
    (events, config)
}

fn n_arrived(events: &Mutex<Vec<Event>>, name: &str) -> usize {
    events.lock().unwrap().iter().filter(|e| matches!(e, Event::Arrived { name: n, .. } if n == name)).count()
}

#[test]
fn echo_request_reply() {
    let (server_events, server_config) = config_with(Some("pong"), true);
    let server = conduit_rt::Dispatcher::new(server_config).unwrap();
    let addr = server.listen(local_addr()).unwrap();
    server.run();

    let (client_events, client_config) = config_with(None, true);
    let client = conduit_rt::Dispatcher::new(client_config).unwrap();
    client.run();

    let connected = Arc::new(AtomicBool::new(false));
    let connected2 = connected.clone();
    client
        .connect(addr, move |_err| {
            connected2.store(false, Ordering::SeqCst);
        })
        .unwrap();

    assert!(wait_until(|| !client.connections().is_empty(), Duration::from_secs(2)));
    let _ = connected.load(Ordering::SeqCst);

    let id = client.connections()[0];
    client.send_one(id, LineMessage::new("ping", "x")).unwrap();

    assert!(wait_until(|| n_arrived(&server_events, "ping") == 1, Duration::from_secs(2)));
    assert!(wait_until(|| n_arrived(&client_events, "pong") == 1, Duration::from_secs(2)));

    let client_log = client_events.lock().unwrap().clone();
    let sent_idx = client_log.iter().position(|e| matches!(e, Event::Sent { name, .. } if name == "ping"));
    let arrived_idx = client_log.iter().position(|e| matches!(e, Event::Arrived { name, .. } if name == "pong"));
    assert!(sent_idx.unwrap() < arrived_idx.unwrap(), "sent must precede the reply's arrived event");
    assert!(!client_log.iter().any(|e| matches!(e, Event::Timeout { .. })));

    assert!(client.stop(STOP_TIMEOUT));
    assert!(server.stop(STOP_TIMEOUT));
}

#[test]
fn reply_timeout_path() {
    let (_server_events, server_config) = config_with(None, true);
    let server = conduit_rt::Dispatcher::new(server_config).unwrap();
    let addr = server.listen(local_addr()).unwrap();
    server.run();

    let (client_events, client_config) = config_with(None, true);
    let client = conduit_rt::Dispatcher::new(client_config).unwrap();
    client.run();

    client.connect(addr, |_| {}).unwrap();
    assert!(wait_until(|| !client.connections().is_empty(), Duration::from_secs(2)));

    let id = client.connections()[0];
    client.send_one(id, LineMessage::new("ping", "x")).unwrap();

    assert!(wait_until(
        || client_events.lock().unwrap().iter().any(|e| matches!(e, Event::Timeout { name, .. } if name == "ping")),
        Duration::from_secs(2)
    ));
    assert!(!client_events.lock().unwrap().iter().any(|e| matches!(e, Event::Arrived { .. })));

    assert!(client.stop(STOP_TIMEOUT));
    assert!(server.stop(STOP_TIMEOUT));
}

#[test]
fn disallowed_reply_keeps_timeout_armed() {
    let (_server_events, server_config) = config_with(Some("pang"), true);
    let server = conduit_rt::Dispatcher::new(server_config).unwrap();
    let addr = server.listen(local_addr()).unwrap();
    server.run();

    let (client_events, client_config) = config_with(None, true);
    let client = conduit_rt::Dispatcher::new(client_config).unwrap();
    client.run();

    client.connect(addr, |_| {}).unwrap();
    assert!(wait_until(|| !client.connections().is_empty(), Duration::from_secs(2)));

    let id = client.connections()[0];
    client.send_one(id, LineMessage::new("ping", "x")).unwrap();

    assert!(wait_until(
        || client_events.lock().unwrap().iter().any(|e| matches!(e, Event::Error(msg) if msg.contains("disallowed") || msg.contains("not allowed"))),
        Duration::from_secs(2)
    ));
    assert!(!client_events.lock().unwrap().iter().any(|e| matches!(e, Event::Arrived { name, .. } if name == "pang")));

    // the request's own timeout must still fire since the disallowed reply
    // didn't correlate it away
    assert!(wait_until(
        || client_events.lock().unwrap().iter().any(|e| matches!(e, Event::Timeout { name, .. } if name == "ping")),
        Duration::from_secs(2)
    ));

    assert!(client.stop(STOP_TIMEOUT));
    assert!(server.stop(STOP_TIMEOUT));
}

#[test]
fn connect_failure_leaves_client_usable() {
    // Bind and immediately drop a listener to obtain a port nobody is
    // listening on.
    let probe = std::net::TcpListener::bind(local_addr()).unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);

    let (_events, client_config) = config_with(None, false);
    let client = conduit_rt::Dispatcher::new(client_config).unwrap();
    client.run();

    let failed = Arc::new(AtomicBool::new(false));
    let failed2 = failed.clone();
    client.connect(dead_addr, move |_err| failed2.store(true, Ordering::SeqCst)).unwrap();

    assert!(wait_until(|| failed.load(Ordering::SeqCst), Duration::from_secs(2)));
    assert!(client.connections().is_empty(), "a failed connect must not leave a communicator behind");

    // the client dispatcher is still usable for another connect attempt
    let (server_events, server_config) = config_with(Some("pong"), false);
    let server = conduit_rt::Dispatcher::new(server_config).unwrap();
    let addr = server.listen(local_addr()).unwrap();
    server.run();

    client.connect(addr, |_| {}).unwrap();
    assert!(wait_until(|| !client.connections().is_empty(), Duration::from_secs(2)));

    let id = client.connections()[0];
    client.send_one(id, LineMessage::new("ping", "still alive")).unwrap();
    assert!(wait_until(|| n_arrived(&server_events, "ping") == 1, Duration::from_secs(2)));

    assert!(client.stop(STOP_TIMEOUT));
    assert!(server.stop(STOP_TIMEOUT));
}

#[test]
fn priority_interleaving_drains_highest_first() {
    let (server_events, server_config) = config_with(None, false);
    let server = conduit_rt::Dispatcher::new(server_config).unwrap();
    let addr = server.listen(local_addr()).unwrap();
    server.run();

    let (_client_events, client_config) = config_with(None, false);
    let client = conduit_rt::Dispatcher::new(client_config).unwrap();
    client.run();

    client.connect(addr, |_| {}).unwrap();
    assert!(wait_until(|| !client.connections().is_empty(), Duration::from_secs(2)));
    let id = client.connections()[0];

    for priority in [1, 5, 3] {
        let mut m = LineMessage::new("mark", &priority.to_string());
        m.set_priority(Priority::new(priority));
        client.send_one(id, m).unwrap();
    }

    assert!(wait_until(|| n_arrived(&server_events, "mark") == 3, Duration::from_secs(2)));

    let order: Vec<String> = server_events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Arrived { name, payload, .. } if name == "mark" => Some(payload.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["5", "3", "1"]);

    assert!(client.stop(STOP_TIMEOUT));
    assert!(server.stop(STOP_TIMEOUT));
}

#[test]
fn orderly_shutdown_preserves_sent_disconnected_exclusivity() {
    let (server_events, server_config) = config_with(None, false);
    let server = conduit_rt::Dispatcher::new(server_config).unwrap();
    let addr = server.listen(local_addr()).unwrap();
    server.run();

    let (client_events, client_config) = config_with(None, false);
    let client = conduit_rt::Dispatcher::new(client_config).unwrap();
    client.run();

    const N_CONNS: usize = 10;
    const N_MSGS: usize = 100;
    for _ in 0..N_CONNS {
        client.connect(addr, |_| {}).unwrap();
    }
    assert!(wait_until(|| client.connections().len() == N_CONNS, Duration::from_secs(2)));

    let counter = Arc::new(AtomicUsize::new(0));
    client.send_all({
        let counter = counter.clone();
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            LineMessage::new("burst", &n.to_string())
        }
    });
    // send_all enqueues one message per connection per call; loop to reach
    // N_MSGS total across N_CONNS connections.
    while counter.load(Ordering::SeqCst) < N_CONNS * N_MSGS {
        client.send_all({
            let counter = counter.clone();
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                LineMessage::new("burst", &n.to_string())
            }
        });
    }

    let stopped = client.stop(STOP_TIMEOUT);

    let log = client_events.lock().unwrap();
    let sent_count = log.iter().filter(|e| matches!(e, Event::Sent { name, .. } if name == "burst")).count();
    let disconnected_count = log.iter().filter(|e| matches!(e, Event::Disconnected)).count();
    assert_eq!(disconnected_count, N_CONNS);
    assert!(sent_count <= N_CONNS * N_MSGS * 2, "sanity bound, no runaway duplication");
    assert!(stopped, "dispatcher should fully drain and stop within the timeout");

    assert!(server.stop(STOP_TIMEOUT));
    let _ = server_events;
}

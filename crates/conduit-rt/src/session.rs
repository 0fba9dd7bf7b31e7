use std::net::SocketAddr;

use crate::{
    error::{Error, HandlerResult},
    ids::{ConnId, MsgId},
    message::Message,
};

/// Object-safe connection operations, implemented by `Communicator<C>` for
/// its own `C::Message`. Kept separate from the `Codec` trait so `Session`
/// implementors don't need to name the codec type.
pub trait ConnOps<M: Message>: Send + Sync {
    fn id(&self) -> ConnId;
    fn remote_endpoint(&self) -> SocketAddr;
    fn send(&self, message: M) -> MsgId;
    fn send_boxed(&self, message: M, on_sent: Box<dyn FnOnce() + Send>) -> MsgId;
    fn disconnect(&self);
}

/// A thin handle into a live connection, passed to every session callback.
/// Forwards to the communicator's already-synchronised public API, so
/// calling `send`/`disconnect` reentrantly from within a handler is safe.
pub struct ConnHandle<'a, M: Message> {
    pub(crate) ops: &'a dyn ConnOps<M>,
}

impl<'a, M: Message> ConnHandle<'a, M> {
    pub fn id(&self) -> ConnId {
        self.ops.id()
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.ops.remote_endpoint()
    }

    pub fn send(&self, message: M) -> MsgId {
        self.ops.send(message)
    }

    pub fn send_with(&self, message: M, on_sent: impl FnOnce() + Send + 'static) -> MsgId {
        self.ops.send_boxed(message, Box::new(on_sent))
    }

    pub fn disconnect(&self) {
        self.ops.disconnect();
    }
}

/// Parameters for the `arrived` event: the decoded message, plus the ability
/// to attach an outbound reply (correlated automatically by the runtime).
pub struct Arrived<M: Message> {
    pub message: M,
    pub(crate) outbound: Option<(M, Option<Box<dyn FnOnce() + Send>>)>,
}

impl<M: Message> Arrived<M> {
    pub(crate) fn new(message: M) -> Self {
        Self { message, outbound: None }
    }

    pub fn reply(&mut self, message: M) {
        self.outbound = Some((message, None));
    }

    pub fn reply_with(&mut self, message: M, on_sent: impl FnOnce() + Send + 'static) {
        self.outbound = Some((message, Some(Box::new(on_sent))));
    }
}

/// The event surface a user session implements. Default bodies are no-ops,
/// matching the spec's "handlers return promptly" expectation — most
/// sessions only override the handful of events they care about.
///
/// `on_disconnected` and `on_error` may **not** throw: a panicking
/// implementation is caught by the runtime and turned into a `safe_panic!`
/// (debug-panics, release-logs) rather than propagated, per the throw
/// contract.
pub trait Session: Send + 'static {
    type Message: Message;

    fn on_connected(&mut self, _conn: &ConnHandle<'_, Self::Message>) -> HandlerResult {
        Ok(())
    }

    fn on_arrived(
        &mut self,
        _conn: &ConnHandle<'_, Self::Message>,
        _arrived: &mut Arrived<Self::Message>,
    ) -> HandlerResult {
        Ok(())
    }

    fn on_sent(&mut self, _conn: &ConnHandle<'_, Self::Message>, _name: &str, _id: MsgId) -> HandlerResult {
        Ok(())
    }

    fn on_timeout(&mut self, _conn: &ConnHandle<'_, Self::Message>, _name: &str, _id: MsgId) -> HandlerResult {
        Ok(())
    }

    fn on_after_processed(&mut self, _conn: &ConnHandle<'_, Self::Message>) -> HandlerResult {
        Ok(())
    }

    fn on_disconnected(&mut self, _conn: &ConnHandle<'_, Self::Message>) {}

    fn on_error(&mut self, _conn: &ConnHandle<'_, Self::Message>, _err: &Error) {}
}

use crate::{message::Message, session::Session};

/// User-supplied framing + serialisation. `decode` is pure over a borrowed
/// slice: the communicator, not the codec, erases the consumed prefix from
/// the connection's in-buffer once a message is returned.
pub trait Codec: Send + Sync + 'static {
    type Message: Message;
    type Session: Session<Message = Self::Message>;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns `Ok(None)` when `buf` doesn't yet hold a complete message —
    /// the runtime leaves the buffer untouched and stops decoding until more
    /// bytes arrive. Returns `Ok(Some((message, consumed)))` otherwise,
    /// where `consumed` is the number of leading bytes of `buf` the message
    /// occupied.
    fn decode(
        &self,
        buf: &[u8],
        session: &mut Self::Session,
    ) -> Result<Option<(Self::Message, usize)>, Self::Error>;

    /// Must be pure and must not retain references to `message`/`session`
    /// past return.
    fn encode(&self, message: &Self::Message, session: &Self::Session) -> Vec<u8>;
}

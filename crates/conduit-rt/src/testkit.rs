//! Minimal message/session/codec triple shared by unit tests across this
//! crate. The self-contained line codec used by the end-to-end tests in
//! `tests/e2e.rs` is defined there, independently of this module.
#![cfg(test)]

use std::sync::Arc;

use crate::{
    codec::Codec,
    config::{Config, ConfigBuilder},
    ids::MsgId,
    message::Message,
    priority::Priority,
    session::Session,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct TestMessage {
    pub(crate) name: String,
    pub(crate) id: MsgId,
    pub(crate) reply_id: MsgId,
    pub(crate) priority: Priority,
}

impl TestMessage {
    pub(crate) fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Self::default() }
    }
}

impl Message for TestMessage {
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

#[derive(Default)]
pub(crate) struct TestSession;

impl Session for TestSession {
    type Message = TestMessage;
}

#[derive(Debug, thiserror::Error)]
#[error("test codec never fails")]
pub(crate) struct TestCodecError;

pub(crate) struct TestCodec;

impl Codec for TestCodec {
    type Message = TestMessage;
    type Session = TestSession;
    type Error = TestCodecError;

    fn decode(&self, _buf: &[u8], _session: &mut Self::Session) -> Result<Option<(Self::Message, usize)>, Self::Error> {
        Ok(None)
    }

    fn encode(&self, _message: &Self::Message, _session: &Self::Session) -> Vec<u8> {
        Vec::new()
    }
}

pub(crate) fn test_config() -> Arc<Config<TestCodec>> {
    Arc::new(
        ConfigBuilder::<TestCodec>::new()
            .codec(TestCodec)
            .session_factory(|| Ok(TestSession))
            .build()
            .unwrap(),
    )
}

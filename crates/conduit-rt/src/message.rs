use crate::{ids::MsgId, priority::Priority};

/// Minimal contract the runtime needs from a user message type. Application
/// code typically implements this on its own message enum/struct; the
/// runtime fills in `id`/`reply_id`/`priority` when the configuration asks
/// it to (`use_unique_message_id`, `use_default_message_priority`).
pub trait Message: Send + 'static {
    fn name(&self) -> &str;

    fn id(&self) -> MsgId;
    fn set_id(&mut self, id: MsgId);

    fn reply_id(&self) -> MsgId;
    fn set_reply_id(&mut self, id: MsgId);

    fn priority(&self) -> Priority;
    fn set_priority(&mut self, priority: Priority);
}

/// A message handed to the write loop: already encoded, ordered in the
/// out-queue by `(priority, seq)` so that equal priorities drain FIFO.
pub(crate) struct PreparedMessage {
    pub(crate) seq: u64,
    pub(crate) app_id: MsgId,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) bytes: Vec<u8>,
    pub(crate) on_sent: Option<Box<dyn FnOnce() + Send>>,
}

impl PartialEq for PreparedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PreparedMessage {}

impl PartialOrd for PreparedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PreparedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority must pop first, and
        // among equal priorities the earlier sequence number (FIFO) must
        // pop first — so sequence order is reversed here.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Created once the runtime has handed a prepared message's bytes to the
/// transport; drained on the following `process()` tick to emit the `sent`
/// event and arm any reply timeout.
pub(crate) struct SentRecord {
    pub(crate) app_id: MsgId,
    pub(crate) name: String,
    pub(crate) on_sent: Option<Box<dyn FnOnce() + Send>>,
}

use std::{collections::HashMap, time::Duration};

use crate::priority::Priority;

/// Per-message-name metadata, immutable once the [`Config`](crate::config::Config)
/// is built.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub name: String,
    pub needs_reply: bool,
    /// `None` means no deadline (infinite).
    pub timeout: Option<Duration>,
    /// Empty means any reply name is allowed.
    pub allowed_replies: Vec<String>,
    pub default_priority: Priority,
}

impl MessageInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needs_reply: false,
            timeout: None,
            allowed_replies: Vec::new(),
            default_priority: Priority::UNDEFINED,
        }
    }

    pub fn needs_reply(mut self, value: bool) -> Self {
        self.needs_reply = value;
        self
    }

    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = Some(value);
        self
    }

    pub fn allowed_replies(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_replies = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_priority(mut self, value: Priority) -> Self {
        self.default_priority = value;
        self
    }

    /// `answers(Q) = ∅ ⇒ yes; else R ∈ answers(Q)`.
    pub fn allows_reply(&self, reply_name: &str) -> bool {
        self.allowed_replies.is_empty() || self.allowed_replies.iter().any(|n| n == reply_name)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MessageRegistry {
    entries: HashMap<String, MessageInfo>,
}

impl MessageRegistry {
    pub fn insert(&mut self, info: MessageInfo) {
        self.entries.insert(info.name.clone(), info);
    }

    /// Lookup by name; absent names get a defaulted entry (needs_reply=false,
    /// timeout=infinite, answers=any, priority=undefined) rather than `None`.
    pub fn lookup(&self, name: &str) -> MessageInfo {
        self.entries.get(name).cloned().unwrap_or_else(|| MessageInfo::new(name))
    }
}

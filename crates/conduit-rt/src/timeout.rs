use std::{collections::HashMap, time::Instant};

use crate::ids::MsgId;

pub(crate) struct TimeoutEntry {
    pub(crate) name: String,
    pub(crate) deadline: Instant,
}

/// A plain linear-scan map, walked once per `process()` tick — matching
/// spec's "walk the timeouts map" rather than a timer heap.
#[derive(Default)]
pub(crate) struct TimeoutMap(HashMap<MsgId, TimeoutEntry>);

impl TimeoutMap {
    pub(crate) fn insert(&mut self, id: MsgId, name: String, deadline: Instant) {
        self.0.insert(id, TimeoutEntry { name, deadline });
    }

    pub(crate) fn remove(&mut self, id: MsgId) -> Option<TimeoutEntry> {
        self.0.remove(&id)
    }

    pub(crate) fn contains(&self, id: MsgId) -> bool {
        self.0.contains_key(&id)
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<(MsgId, TimeoutEntry)> {
        let expired: Vec<MsgId> =
            self.0.iter().filter(|(_, e)| e.deadline <= now).map(|(id, _)| *id).collect();
        expired.into_iter().filter_map(|id| self.0.remove(&id).map(|e| (id, e))).collect()
    }
}

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use crate::{codec::Codec, communicator::Communicator, error::Error, ids::ConnId};

struct Inner<C: Codec> {
    primary: HashMap<ConnId, Arc<Communicator<C>>>,
    excluded: HashMap<ConnId, Arc<Communicator<C>>>,
}

/// Thread-safe set of communicators with a check-out/check-in discipline:
/// `take_out` moves one communicator from `primary` to `excluded` and hands
/// it to a worker, which processes it without any other worker touching it,
/// then returns it via `get_back`. Everything is serialised by one `Mutex`;
/// no worker holds this lock while running a communicator's `process()`, so
/// processing never blocks other containers operations.
pub(crate) struct Container<C: Codec> {
    inner: Mutex<Inner<C>>,
}

impl<C: Codec> Default for Container<C> {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { primary: HashMap::new(), excluded: HashMap::new() }) }
    }
}

impl<C: Codec> Container<C> {
    pub(crate) fn insert(&self, comm: Arc<Communicator<C>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.primary.entry(comm.id()).or_insert(comm);
    }

    pub(crate) fn take_out(&self) -> Option<Arc<Communicator<C>>> {
        let mut inner = self.inner.lock().unwrap();
        let id = *inner.primary.keys().next()?;
        let comm = inner.primary.remove(&id).unwrap();
        inner.excluded.insert(id, comm.clone());
        Some(comm)
    }

    pub(crate) fn take_out_all_ready(&self) -> Vec<Arc<Communicator<C>>> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<ConnId> = inner.primary.keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(comm) = inner.primary.remove(&id) {
                inner.excluded.insert(id, comm.clone());
                out.push(comm);
            }
        }
        out
    }

    /// Moves a specific connection from `primary` to `excluded`, if it's
    /// still in `primary` — `None` if it was already checked out by another
    /// worker or has been erased. Duplicate kicks for the same id are
    /// therefore harmless no-ops here.
    pub(crate) fn take_out_id(&self, id: ConnId) -> Option<Arc<Communicator<C>>> {
        let mut inner = self.inner.lock().unwrap();
        let comm = inner.primary.remove(&id)?;
        inner.excluded.insert(id, comm.clone());
        Some(comm)
    }

    pub(crate) fn get_back(&self, id: ConnId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(comm) = inner.excluded.remove(&id) {
            inner.primary.insert(id, comm);
        }
    }

    pub(crate) fn get_back_all(&self, ids: impl IntoIterator<Item = ConnId>) {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            if let Some(comm) = inner.excluded.remove(&id) {
                inner.primary.insert(id, comm);
            }
        }
    }

    pub(crate) fn get(&self, id: ConnId) -> Result<Arc<Communicator<C>>, Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .primary
            .get(&id)
            .or_else(|| inner.excluded.get(&id))
            .cloned()
            .ok_or(Error::SessionNotFound(id))
    }

    pub(crate) fn erase(&self, id: ConnId) {
        let mut inner = self.inner.lock().unwrap();
        inner.primary.remove(&id);
        inner.excluded.remove(&id);
    }

    pub(crate) fn connections(&self) -> Vec<ConnId> {
        let inner = self.inner.lock().unwrap();
        inner.primary.keys().chain(inner.excluded.keys()).copied().collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Communicator<C>>> {
        let inner = self.inner.lock().unwrap();
        inner.primary.values().chain(inner.excluded.values()).cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.primary.is_empty() && inner.excluded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::test_support::make_test_communicator;

    #[test]
    fn take_out_excludes_until_returned() {
        let container = Container::default();
        let comm = make_test_communicator(0);
        let id = comm.id();
        container.insert(comm);

        let taken = container.take_out().expect("should take out the one comm");
        assert_eq!(taken.id(), id);
        assert!(container.take_out().is_none(), "already checked out, nothing left in primary");

        container.get_back(id);
        assert!(container.take_out().is_some(), "returned to primary, available again");
    }

    #[test]
    fn take_out_id_is_idempotent_against_duplicate_kicks() {
        let container = Container::default();
        let comm = make_test_communicator(2);
        let id = comm.id();
        container.insert(comm);

        assert!(container.take_out_id(id).is_some());
        assert!(container.take_out_id(id).is_none(), "already excluded, duplicate kick is a no-op");

        container.get_back(id);
        assert!(container.take_out_id(id).is_some());
    }

    #[test]
    fn erase_removes_from_either_set() {
        let container = Container::default();
        let comm = make_test_communicator(1);
        let id = comm.id();
        container.insert(comm);
        let _taken = container.take_out().unwrap();

        container.erase(id);
        assert!(container.get(id).is_err());
    }

    /// `connections()` must actually enumerate both sets, not just the
    /// primary one — a checked-out connection is still a live connection.
    #[test]
    fn connections_enumerates_primary_and_excluded() {
        let container = Container::default();
        let a = make_test_communicator(10);
        let b = make_test_communicator(11);
        let id_a = a.id();
        let id_b = b.id();
        container.insert(a);
        container.insert(b);

        let _taken = container.take_out_id(id_a).unwrap();

        let mut ids = container.connections();
        ids.sort();
        let mut expected = [id_a, id_b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}

//! The in-flight request tracker.
//!
//! A key->value mapping from [`RequestId`](crate::message::RequestId) to the original
//! request message, plus a distinguished slot for the most recently forwarded Login
//! message (consulted by the permission-retry path). All access is serialized behind a
//! single `parking_lot::Mutex` — the table is touched from both pump directions and
//! readers must observe a consistent snapshot.

use crate::message::{Message, RequestId};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    by_request_id: HashMap<RequestId, Message>,
    last_login: Option<Message>,
}

pub struct InFlightTable {
    inner: Mutex<Inner>,
}

impl Default for InFlightTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a request forwarded to the controller.
    pub fn insert(&self, request: Message) {
        self.inner.lock().by_request_id.insert(request.request_id, request);
    }

    /// Remove and return the entry correlating to a response, if any.
    pub fn remove(&self, request_id: RequestId) -> Option<Message> {
        self.inner.lock().by_request_id.remove(&request_id)
    }

    /// Look up the pending request for a response without removing it (used by the
    /// permission-retry path, which must not drop the entry).
    pub fn peek(&self, request_id: RequestId) -> Option<Message> {
        self.inner.lock().by_request_id.get(&request_id).cloned()
    }

    /// Record a successfully forwarded Login message, replacing any previous one.
    pub fn set_last_login(&self, login: Message) {
        self.inner.lock().last_login = Some(login);
    }

    pub fn last_login(&self) -> Option<Message> {
        self.inner.lock().last_login.clone()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_request_id.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().by_request_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: RequestId) -> Message {
        Message {
            request_id: id,
            facade_type: Some("Client".to_owned()),
            request: Some("ListModels".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn insert_then_remove_empties_table() {
        let table = InFlightTable::new();
        table.insert(req(1));
        assert_eq!(table.len(), 1);
        let removed = table.remove(1).unwrap();
        assert_eq!(removed.request_id, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn peek_does_not_remove() {
        let table = InFlightTable::new();
        table.insert(req(5));
        assert!(table.peek(5).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn last_login_slot_tracks_most_recent() {
        let table = InFlightTable::new();
        table.set_last_login(req(1));
        table.set_last_login(req(2));
        assert_eq!(table.last_login().unwrap().request_id, 2);
    }
}

//! Correlation table bridging one asynchronous request across two
//! connections.
//!
//! When the router proxies a request to a handler connection it allocates a
//! correlation id, sends the request to the handler under that id, and
//! parks the (requester, original request id) pair here. The handler's
//! response carries the correlation id back; resolving consumes the entry
//! exactly once. Entries whose endpoints disconnect are swept out so the
//! other side never waits on a response that cannot arrive.

use std::collections::HashMap;

use arbor_core::EntityRef;
use arbor_protocol::MessageType;

use crate::registry::ConnId;

/// One parked proxied request.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelationEntry {
    pub requester: ConnId,
    pub requester_request_id: u32,
    pub responder: ConnId,
    /// Message type of the original request, echoed in synthetic errors.
    pub origin: MessageType,
    /// Entity the request touched, when known.
    pub entity: Option<EntityRef>,
}

/// Correlation id -> pending entry. Ids are monotonically increasing and
/// never zero (zero marks unsolicited pushes on the wire).
#[derive(Debug, Default)]
pub struct Correlator {
    entries: HashMap<u32, CorrelationEntry>,
    next_id: u32,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Park a proxied request and allocate its correlation id.
    pub fn propose(
        &mut self,
        requester: ConnId,
        requester_request_id: u32,
        responder: ConnId,
        origin: MessageType,
        entity: Option<EntityRef>,
    ) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        self.entries.insert(
            id,
            CorrelationEntry {
                requester,
                requester_request_id,
                responder,
                origin,
                entity,
            },
        );
        id
    }

    /// Consume the entry for a correlation id. Returns `None` when it was
    /// already resolved or invalidated — late responses are dropped.
    pub fn resolve(&mut self, correlation_id: u32) -> Option<CorrelationEntry> {
        self.entries.remove(&correlation_id)
    }

    /// Remove every entry in which `conn` participates and return the ones
    /// whose *other* party may still be waiting for a response.
    pub fn invalidate_all(&mut self, conn: ConnId) -> Vec<CorrelationEntry> {
        let ids: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.requester == conn || entry.responder == conn)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .filter(|entry| entry.responder == conn)
            .collect()
    }

    /// Number of parked requests; used by tests and metrics.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use arbor_core::{EntityKind, EntityRef};

    use super::*;

    fn propose(correlator: &mut Correlator, requester: ConnId, responder: ConnId) -> u32 {
        correlator.propose(
            requester,
            9,
            responder,
            MessageType::CreateEntity,
            Some(EntityRef::new(EntityKind::MarketOrder, 1)),
        )
    }

    #[test]
    fn resolve_consumes_exactly_once() {
        let mut correlator = Correlator::new();
        let id = propose(&mut correlator, 1, 2);
        let entry = correlator.resolve(id).unwrap();
        assert_eq!(entry.requester, 1);
        assert_eq!(entry.requester_request_id, 9);
        assert!(correlator.resolve(id).is_none());
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn responder_disconnect_yields_waiting_requesters() {
        let mut correlator = Correlator::new();
        let id = propose(&mut correlator, 1, 2);
        propose(&mut correlator, 2, 3); // conn 2 is also a requester elsewhere

        let orphaned = correlator.invalidate_all(2);
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].requester, 1);
        assert!(correlator.resolve(id).is_none());
        // the entry where conn 2 was the requester is gone without notice
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn requester_disconnect_is_silent() {
        let mut correlator = Correlator::new();
        propose(&mut correlator, 1, 2);
        let orphaned = correlator.invalidate_all(1);
        assert!(orphaned.is_empty());
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn ids_are_never_zero() {
        let mut correlator = Correlator::new();
        correlator.next_id = u32::MAX;
        let id = propose(&mut correlator, 1, 2);
        assert_eq!(id, u32::MAX);
        let wrapped = propose(&mut correlator, 1, 2);
        assert_eq!(wrapped, 1);
    }
}

//! Registry of live connections and their outbound frame queues.
//!
//! Each connection task owns a writer draining an unbounded channel into
//! the socket; everything else sends through here. Sends to connections
//! that are gone are silently dropped — disconnect cleanup races are
//! harmless by construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use arbor_protocol::{Frame, Message};

/// Identifier of one live connection, unique for the broker's lifetime.
pub type ConnId = u64;

#[derive(Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<ConnId, UnboundedSender<Frame>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection's outbound queue and allocate its id.
    pub fn insert(&self, sender: UnboundedSender<Frame>) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.lock().insert(id, sender);
        id
    }

    pub fn remove(&self, conn: ConnId) {
        self.conns.lock().remove(&conn);
    }

    #[must_use]
    pub fn contains(&self, conn: ConnId) -> bool {
        self.conns.lock().contains_key(&conn)
    }

    /// Queue a raw frame for a connection.
    pub fn send_frame(&self, conn: ConnId, frame: Frame) {
        if let Some(sender) = self.conns.lock().get(&conn) {
            let _ = sender.send(frame);
        }
    }

    /// Queue a typed message for a connection.
    pub fn send(&self, conn: ConnId, message: &Message, request_id: u32) {
        self.send_frame(conn, message.encode(request_id));
    }

    /// Number of live connections; used by metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }
}

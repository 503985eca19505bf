//! The broker's connection layer: a TCP server speaking the arbor protocol,
//! a per-connection router owning the role state machine, and the request
//! correlator that bridges proxied calls between viewer and handler
//! connections.
//!
//! All shared mutable state (directory, correlator, viewer/handler bindings)
//! lives behind one mutex with short, synchronous critical sections; store
//! persistence and socket writes happen outside the lock.

use thiserror::Error;

pub mod auth;
pub mod correlate;
pub mod registry;
pub mod router;
pub mod server;
mod shared;

pub use correlate::{CorrelationEntry, Correlator};
pub use registry::{ConnId, ConnectionRegistry};
pub use router::{Connection, Role};
pub use server::Server;
pub use shared::{BrokerShared, EntityKey};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failures raised by the broker runtime itself (not request errors, which
/// travel back to clients as protocol `ErrorResponse` frames).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] arbor_protocol::ProtocolError),
    #[error("store error: {0}")]
    Store(#[from] arbor_store::StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

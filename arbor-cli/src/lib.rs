//! Library surface of the broker binary, split out so integration tests can
//! drive the runtime wiring directly.

pub mod app;
pub mod telemetry;

//! Operating-mode switches for sessions.
//!
//! A session's live ledger must survive any simulation excursion untouched,
//! and the bot process must be fully detached before the active ledger can
//! change under it. The attachment check lives here so every caller goes
//! through it.

use arbor_core::{EntityKind, EntityRef, Session};

use crate::{DirectoryError, DirectoryResult};

/// Activate a fresh simulation ledger seeded from the session's configured
/// initial balances. The live ledger is preserved as-is.
pub fn enter_simulation(session: &mut Session, handler_attached: bool) -> DirectoryResult<()> {
    guard_detached(session, handler_attached)?;
    session.activate_simulation();
    Ok(())
}

/// Re-activate the live ledger, discarding whatever the simulation produced.
pub fn enter_live(session: &mut Session, handler_attached: bool) -> DirectoryResult<()> {
    guard_detached(session, handler_attached)?;
    session.activate_live();
    Ok(())
}

fn guard_detached(session: &Session, handler_attached: bool) -> DirectoryResult<()> {
    if handler_attached {
        return Err(DirectoryError::HandlerAttached(EntityRef::new(
            EntityKind::Session,
            session.id,
        )));
    }
    Ok(())
}

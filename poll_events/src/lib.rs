mod aggregate;
pub mod builder;
mod config;
mod events;
pub mod manual;
pub mod migrate;
mod rooms;
mod selector;
mod store;
pub mod validate;

use log::{debug, warn};

pub use crate::aggregate::aggregate;
pub use crate::config::*;
pub use crate::events::*;
pub use crate::migrate::{migrate, Canonical};
pub use crate::rooms::Rooms;
pub use crate::selector::ResultSelector;
pub use crate::store::{Applied, PollStore, Reference, Versioned};
pub use crate::validate::{validate, validate_event};

/// Validates, upgrades and applies one raw event to the store of its room.
///
/// Returns an error if the event was dropped. The store is unchanged in
/// that case and the next events can be ingested as usual.
pub fn ingest(store: &mut PollStore, raw: &RawEvent) -> EventResult<Applied> {
    match ingest_inner(store, raw) {
        Ok(applied) => Ok(applied),
        Err(e @ EventError::UnknownEventType { .. }) => {
            // Rooms carry many events unrelated to polls.
            debug!("ingest: skipping {}: {}", raw.identity(), e);
            Err(e)
        }
        Err(e) => {
            warn!("ingest: dropping event {}: {}", raw.identity(), e);
            Err(e)
        }
    }
}

fn ingest_inner(store: &mut PollStore, raw: &RawEvent) -> EventResult<Applied> {
    let validated = validate_event(raw)?;
    let payload = migrate(validated.payload)?;
    Ok(store.apply(CanonicalEvent {
        meta: validated.meta,
        state_key: validated.state_key,
        payload,
    }))
}

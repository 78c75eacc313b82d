use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;

use crate::config::*;
use crate::events::{EventResult, RawEvent};
use crate::selector::ResultSelector;
use crate::store::{Applied, PollStore};

/// One store per room, and a single selector over all of them.
///
/// Events are routed by their room id. Each room is applied in arrival
/// order and rooms never see each other's events.
pub struct Rooms {
    stores: BTreeMap<String, PollStore>,
    selector: ResultSelector,
}

impl Rooms {
    pub fn new(rules: &TallyRules) -> Rooms {
        Rooms {
            stores: BTreeMap::new(),
            selector: ResultSelector::new(rules),
        }
    }

    /// Ingests an event into the store of its room, creating it if needed.
    /// A dropped event does not create a store.
    pub fn ingest(&mut self, raw: &RawEvent) -> EventResult<Applied> {
        if let Some(store) = self.stores.get_mut(&raw.room_id) {
            return crate::ingest(store, raw);
        }
        let mut store = PollStore::new(&raw.room_id);
        let applied = crate::ingest(&mut store, raw)?;
        debug!("Rooms::ingest: new room {}", raw.room_id);
        self.stores.insert(raw.room_id.clone(), store);
        Ok(applied)
    }

    pub fn store(&self, room_id: &str) -> Option<&PollStore> {
        self.stores.get(room_id)
    }

    /// All the stores, sorted by room id.
    pub fn stores(&self) -> impl Iterator<Item = &PollStore> {
        self.stores.values()
    }

    pub fn rules(&self) -> &TallyRules {
        self.selector.rules()
    }

    pub fn select(&self, room_id: &str, poll_id: &str, now: DateTime<Utc>) -> Option<PollResult> {
        self.selector.select(self.store(room_id)?, poll_id, now)
    }

    /// The results of every poll of a room, in display order.
    pub fn results(&self, room_id: &str, now: DateTime<Utc>) -> Vec<PollResult> {
        match self.store(room_id) {
            Some(store) => self.selector.select_all(store, now),
            None => Vec::new(),
        }
    }
}

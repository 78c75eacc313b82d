// The per-room state derived from canonical events.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::config::*;
use crate::events::{CanonicalEvent, EventMeta};
use crate::migrate::Canonical;

/// A payload together with the event that carried it.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Versioned<T> {
    pub meta: EventMeta,
    pub content: T,
}

/// An entity that an applied event points to but that has not been seen yet.
/// The event is kept: it takes effect as soon as the entity arrives.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd)]
pub enum Reference {
    Poll(String),
}

#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct Applied {
    pub changed: bool,
    pub unresolved: Vec<Reference>,
}

/// All the poll state of one room.
///
/// Events are applied one at a time in arrival order. Applying is an
/// idempotent upsert: a duplicate or an event older than the one already
/// held for the same key leaves the store untouched, so the final state does
/// not depend on delivery order.
#[derive(PartialEq, Debug, Clone)]
pub struct PollStore {
    room_id: String,
    revision: u64,
    seen: HashSet<String>,
    room_name: Option<Versioned<RoomNameContent>>,
    groups: BTreeMap<String, Versioned<GroupContent>>,
    polls: BTreeMap<String, Versioned<PollContent>>,
    // Keyed by scope: the empty string for the room, a group id otherwise.
    settings: BTreeMap<String, Versioned<PollSettingsContent>>,
    // poll id -> voter -> the active vote of this voter.
    votes: BTreeMap<String, BTreeMap<String, Versioned<VoteContent>>>,
    // The store revision of the last change that affected each poll.
    poll_revisions: HashMap<String, u64>,
}

fn upsert<T>(
    slots: &mut BTreeMap<String, Versioned<T>>,
    key: &str,
    meta: EventMeta,
    content: T,
) -> bool {
    match slots.get(key) {
        Some(current) if !meta.supersedes(&current.meta) => false,
        _ => {
            slots.insert(key.to_string(), Versioned { meta, content });
            true
        }
    }
}

impl PollStore {
    pub fn new(room_id: &str) -> PollStore {
        PollStore {
            room_id: room_id.to_string(),
            revision: 0,
            seen: HashSet::new(),
            room_name: None,
            groups: BTreeMap::new(),
            polls: BTreeMap::new(),
            settings: BTreeMap::new(),
            votes: BTreeMap::new(),
            poll_revisions: HashMap::new(),
        }
    }

    /// Applies one canonical event. Never fails: the returned value tells
    /// whether the state changed and which references are still pending.
    pub fn apply(&mut self, event: CanonicalEvent) -> Applied {
        let CanonicalEvent {
            meta,
            state_key,
            payload,
        } = event;
        if meta.room_id != self.room_id {
            warn!(
                "apply: event {} belongs to room {}, not {}",
                meta.identity, meta.room_id, self.room_id
            );
            return Applied::default();
        }
        if !self.seen.insert(meta.identity.clone()) {
            debug!("apply: duplicate delivery of {}", meta.identity);
            return Applied::default();
        }

        let mut touched: Vec<String> = Vec::new();
        let mut unresolved: Vec<Reference> = Vec::new();
        let changed = match payload {
            Canonical::Poll(content) => {
                touched.push(state_key.clone());
                upsert(&mut self.polls, &state_key, meta, content)
            }
            Canonical::Group(content) => {
                // Polls leaving the group are affected as well as the new ones.
                if let Some(previous) = self.groups.get(&state_key) {
                    touched.extend(previous.content.poll_ids.iter().cloned());
                }
                touched.extend(content.poll_ids.iter().cloned());
                let changed = upsert(&mut self.groups, &state_key, meta, content);
                if changed {
                    unresolved.extend(
                        self.groups[&state_key]
                            .content
                            .poll_ids
                            .iter()
                            .filter(|id| !self.polls.contains_key(*id))
                            .map(|id| Reference::Poll(id.clone())),
                    );
                }
                changed
            }
            Canonical::PollSettings(content) => {
                upsert(&mut self.settings, &state_key, meta, content)
            }
            Canonical::Vote(content) => {
                let poll_id = content.poll_id.clone();
                let voter = meta.sender.clone();
                if !self.polls.contains_key(&poll_id) {
                    unresolved.push(Reference::Poll(poll_id.clone()));
                }
                touched.push(poll_id.clone());
                let ballots = self.votes.entry(poll_id).or_default();
                upsert(ballots, &voter, meta, content)
            }
            Canonical::RoomName(content) => {
                let newer = self
                    .room_name
                    .as_ref()
                    .map_or(true, |current| meta.supersedes(&current.meta));
                if newer {
                    self.room_name = Some(Versioned { meta, content });
                }
                newer
            }
        };

        if !changed {
            return Applied::default();
        }
        self.revision += 1;
        for poll_id in touched {
            self.poll_revisions.insert(poll_id, self.revision);
        }
        debug!(
            "apply: room {} at revision {}, unresolved: {:?}",
            self.room_id, self.revision, unresolved
        );
        Applied {
            changed,
            unresolved,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn room_name(&self) -> Option<&str> {
        self.room_name.as_ref().map(|n| n.content.name.as_str())
    }

    /// Incremented on every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The revision of the last change to the poll, its votes or the
    /// membership of its group.
    pub fn poll_revision(&self, poll_id: &str) -> u64 {
        self.poll_revisions.get(poll_id).cloned().unwrap_or(0)
    }

    pub fn poll(&self, poll_id: &str) -> Option<&Versioned<PollContent>> {
        self.polls.get(poll_id)
    }

    pub fn group(&self, group_id: &str) -> Option<&Versioned<GroupContent>> {
        self.groups.get(group_id)
    }

    /// The group a poll belongs to. When several groups list the poll, the
    /// one with the smallest id is used.
    pub fn group_for_poll(&self, poll_id: &str) -> Option<(&str, &GroupContent)> {
        let mut owners = self
            .groups
            .iter()
            .filter(|(_, group)| group.content.references(poll_id));
        let first = owners.next();
        if first.is_some() && owners.next().is_some() {
            debug!("group_for_poll: poll {} is listed by several groups", poll_id);
        }
        first.map(|(id, group)| (id.as_str(), &group.content))
    }

    /// The active vote of every voter of a poll, sorted by voter.
    pub fn votes_for(&self, poll_id: &str) -> impl Iterator<Item = (&str, &VoteContent)> {
        self.votes
            .get(poll_id)
            .into_iter()
            .flat_map(|ballots| ballots.iter())
            .map(|(voter, vote)| (voter.as_str(), &vote.content))
    }

    /// Votes waiting for their poll, as (poll id, voter) pairs.
    pub fn unresolved_votes(&self) -> Vec<(String, String)> {
        self.votes
            .iter()
            .filter(|(poll_id, _)| !self.polls.contains_key(*poll_id))
            .flat_map(|(poll_id, ballots)| {
                ballots
                    .keys()
                    .map(move |voter| (poll_id.clone(), voter.clone()))
            })
            .collect()
    }

    /// Polls in group order (groups sorted by id), then the polls of no
    /// group, sorted by id.
    pub fn ordered_poll_ids(&self) -> Vec<String> {
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut res: Vec<String> = Vec::new();
        for group in self.groups.values() {
            for poll_id in group.content.poll_ids.iter() {
                if self.polls.contains_key(poll_id) && placed.insert(poll_id.as_str()) {
                    res.push(poll_id.clone());
                }
            }
        }
        for poll_id in self.polls.keys() {
            if placed.insert(poll_id.as_str()) {
                res.push(poll_id.clone());
            }
        }
        res
    }

    /// The settings in force for a group: its own, else the room-wide ones,
    /// else the defaults.
    pub fn settings_for(&self, group_id: Option<&str>) -> PollSettingsContent {
        group_id
            .and_then(|id| self.settings.get(id))
            .or_else(|| self.settings.get(""))
            .map(|s| s.content.clone())
            .unwrap_or_default()
    }

    pub fn may_create_polls(&self, user_id: &str, group_id: &str) -> bool {
        let role = match self.group(group_id).and_then(|g| g.content.role_of(user_id)) {
            Some(role) => role,
            None => return false,
        };
        self.settings_for(Some(group_id))
            .poll_creator_roles
            .contains(&role)
    }

    /// Whether results of the given group may still be exported at `now`.
    pub fn export_allowed(&self, group_id: Option<&str>, now: DateTime<Utc>) -> bool {
        match self.settings_for(group_id).pdf_button_disabled_after {
            Some(limit) => now.timestamp_millis() < i64::try_from(limit).unwrap_or(i64::MAX),
            None => true,
        }
    }
}

// Schema migrations: every past version of a payload is upgraded one version
// at a time until it reaches the current shape.

use std::ops::RangeInclusive;

use chrono::{DateTime, Duration, SecondsFormat};
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::json;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;
use snafu::prelude::*;

use crate::config::*;
use crate::events::*;
use crate::validate::ValidatedPayload;

/// Upgrades a payload from version N to version N + 1.
pub type MigrationStep = fn(JSMap<String, JSValue>) -> JSMap<String, JSValue>;

/// The upgrade steps of one event kind, oldest first.
pub struct MigrationChain {
    /// The oldest version that can still be read.
    pub oldest: u32,
    /// `steps[i]` upgrades version `oldest + i`.
    pub steps: &'static [MigrationStep],
}

impl MigrationChain {
    pub fn current(&self) -> u32 {
        self.oldest + self.steps.len() as u32
    }

    pub fn supports(&self, version: u32) -> bool {
        version >= self.oldest && version <= self.current()
    }

    /// Runs all the steps from `version` to the current version.
    /// A payload already at the current version is returned untouched.
    pub fn upgrade(
        &self,
        kind: EventKind,
        version: u32,
        mut content: JSMap<String, JSValue>,
    ) -> EventResult<JSMap<String, JSValue>> {
        ensure!(
            self.supports(version),
            UnsupportedVersionSnafu {
                kind,
                version: u64::from(version)
            }
        );
        let first = (version - self.oldest) as usize;
        for (offset, step) in self.steps[first..].iter().enumerate() {
            let target = version + offset as u32 + 1;
            debug!("upgrade: {} payload to version {}", kind, target);
            content = step(content);
            content.insert(SCHEMA_VERSION_FIELD.to_string(), json!(target));
        }
        content.insert(SCHEMA_VERSION_FIELD.to_string(), json!(self.current()));
        Ok(content)
    }
}

const GROUP_CHAIN: MigrationChain = MigrationChain {
    oldest: 1,
    steps: &[group_v1_to_v2],
};

const POLL_CHAIN: MigrationChain = MigrationChain {
    oldest: 1,
    steps: &[poll_v1_to_v2, poll_v2_to_v3],
};

const SETTINGS_CHAIN: MigrationChain = MigrationChain {
    oldest: 1,
    steps: &[settings_v1_to_v2],
};

const VOTE_CHAIN: MigrationChain = MigrationChain {
    oldest: 1,
    steps: &[],
};

const ROOM_NAME_CHAIN: MigrationChain = MigrationChain {
    oldest: 1,
    steps: &[],
};

pub fn chain(kind: EventKind) -> &'static MigrationChain {
    match kind {
        EventKind::Group => &GROUP_CHAIN,
        EventKind::Poll => &POLL_CHAIN,
        EventKind::PollSettings => &SETTINGS_CHAIN,
        EventKind::Vote => &VOTE_CHAIN,
        EventKind::RoomName => &ROOM_NAME_CHAIN,
    }
}

pub fn current_version(kind: EventKind) -> u32 {
    chain(kind).current()
}

pub fn supported_versions(kind: EventKind) -> RangeInclusive<u32> {
    let c = chain(kind);
    c.oldest..=c.current()
}

/// A payload in the current schema of its kind.
#[derive(PartialEq, Debug, Clone)]
pub enum Canonical {
    Group(GroupContent),
    Poll(PollContent),
    PollSettings(PollSettingsContent),
    Vote(VoteContent),
    RoomName(RoomNameContent),
}

impl Canonical {
    pub fn kind(&self) -> EventKind {
        match self {
            Canonical::Group(_) => EventKind::Group,
            Canonical::Poll(_) => EventKind::Poll,
            Canonical::PollSettings(_) => EventKind::PollSettings,
            Canonical::Vote(_) => EventKind::Vote,
            Canonical::RoomName(_) => EventKind::RoomName,
        }
    }
}

/// Brings a validated payload to the current schema of its kind.
pub fn migrate(payload: ValidatedPayload) -> EventResult<Canonical> {
    let ValidatedPayload {
        kind,
        version,
        mut content,
    } = payload;
    // Validation reads null fields as absent, so do the steps and serde.
    content.retain(|_, v| !v.is_null());
    let content = JSValue::Object(chain(kind).upgrade(kind, version, content)?);
    let canonical = match kind {
        EventKind::Group => Canonical::Group(canonicalize(kind, content)?),
        EventKind::Poll => Canonical::Poll(canonicalize(kind, content)?),
        EventKind::PollSettings => Canonical::PollSettings(canonicalize(kind, content)?),
        EventKind::Vote => Canonical::Vote(canonicalize(kind, content)?),
        EventKind::RoomName => Canonical::RoomName(canonicalize(kind, content)?),
    };
    Ok(canonical)
}

fn canonicalize<T: DeserializeOwned>(kind: EventKind, content: JSValue) -> EventResult<T> {
    serde_json::from_value(content).map_err(|e| EventError::Canonicalize {
        kind,
        message: e.to_string(),
    })
}

// ******** Steps *********

// v2 gives every member an explicit role. v1 members were all participants.
fn group_v1_to_v2(mut content: JSMap<String, JSValue>) -> JSMap<String, JSValue> {
    let members: JSMap<String, JSValue> = match content.remove("members") {
        Some(JSValue::Array(ids)) => ids
            .iter()
            .filter_map(|id| id.as_str())
            .map(|id| (id.to_string(), json!({ "memberRole": "participant" })))
            .collect(),
        _ => JSMap::new(),
    };
    content.insert("members".to_string(), JSValue::Object(members));
    content
}

// v2 replaces plain answer labels with {id, label} pairs. The ids are the
// 1-based positions of the labels.
fn poll_v1_to_v2(mut content: JSMap<String, JSValue>) -> JSMap<String, JSValue> {
    if let Some(JSValue::Array(labels)) = content.remove("answers") {
        let answers: Vec<JSValue> = labels
            .iter()
            .enumerate()
            .map(|(idx, label)| json!({ "id": (idx + 1).to_string(), "label": label }))
            .collect();
        content.insert("answers".to_string(), JSValue::Array(answers));
    }
    content
}

// v3 renames the `invisible` result type to `hidden` and stores the end time
// of started polls explicitly.
fn poll_v2_to_v3(mut content: JSMap<String, JSValue>) -> JSMap<String, JSValue> {
    if content.get("resultType").and_then(|v| v.as_str()) == Some("invisible") {
        content.insert("resultType".to_string(), json!("hidden"));
    }
    // v2 has no end time field: whatever is there was never validated.
    content.remove("endTime");
    let start = content
        .get("startTime")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    let minutes = content
        .get("duration")
        .and_then(|v| v.as_u64())
        .and_then(|m| u32::try_from(m).ok());
    if let (Some(start), Some(minutes)) = (start, minutes) {
        if let Some(end) = start.checked_add_signed(Duration::minutes(i64::from(minutes))) {
            content.insert(
                "endTime".to_string(),
                json!(end.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            );
        }
    }
    content
}

// v2 makes the poll creator roles explicit. Before, only moderators could
// create polls.
fn settings_v1_to_v2(mut content: JSMap<String, JSValue>) -> JSMap<String, JSValue> {
    content.insert("pollCreatorRoles".to_string(), json!(["moderator"]));
    content
}

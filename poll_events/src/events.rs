// Raw room events, their metadata and the errors raised while reading them.

use std::cmp::Reverse;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;
use snafu::prelude::*;

use crate::migrate::Canonical;

pub const STATE_EVENT_POLL_GROUP: &str = "net.nordeck.poll.group";
pub const STATE_EVENT_POLL: &str = "net.nordeck.poll";
pub const STATE_EVENT_POLL_SETTINGS: &str = "net.nordeck.poll.settings";
pub const ROOM_EVENT_VOTE: &str = "net.nordeck.poll.vote";
pub const STATE_EVENT_ROOM_NAME: &str = "m.room.name";

/// The field every payload uses to declare its schema version.
pub const SCHEMA_VERSION_FIELD: &str = "schemaVersion";

/// The closed set of event kinds this crate understands.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum EventKind {
    Group,
    Poll,
    PollSettings,
    Vote,
    RoomName,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Group,
        EventKind::Poll,
        EventKind::PollSettings,
        EventKind::Vote,
        EventKind::RoomName,
    ];

    pub fn from_event_type(event_type: &str) -> Option<EventKind> {
        Self::ALL
            .iter()
            .find(|kind| kind.event_type() == event_type)
            .cloned()
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::Group => STATE_EVENT_POLL_GROUP,
            EventKind::Poll => STATE_EVENT_POLL,
            EventKind::PollSettings => STATE_EVENT_POLL_SETTINGS,
            EventKind::Vote => ROOM_EVENT_VOTE,
            EventKind::RoomName => STATE_EVENT_ROOM_NAME,
        }
    }

    /// State events are addressed by their state key; the latest one per key wins.
    pub fn is_state(&self) -> bool {
        !matches!(self, EventKind::Vote)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.event_type())
    }
}

/// Reasons for dropping an event. None of them is fatal: the event is
/// ignored and the rest of the stream is processed.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum EventError {
    #[snafu(display("{kind}: missing field {field}"))]
    MissingField { kind: EventKind, field: String },

    #[snafu(display("{kind}: field {field} should be {expected}"))]
    InvalidField {
        kind: EventKind,
        field: String,
        expected: String,
    },

    #[snafu(display("{kind}: field {field} has unknown value {value:?}"))]
    InvalidEnumValue {
        kind: EventKind,
        field: String,
        value: String,
    },

    #[snafu(display("poll answer id {answer_id:?} is used more than once"))]
    DuplicateAnswerId { answer_id: String },

    #[snafu(display("{kind}: schema version {version} is not supported"))]
    UnsupportedVersion { kind: EventKind, version: u64 },

    #[snafu(display("unknown event type {event_type:?}"))]
    UnknownEventType { event_type: String },

    #[snafu(display("{kind}: payload does not match the canonical shape: {message}"))]
    Canonicalize { kind: EventKind, message: String },
}

pub type EventResult<T> = Result<T, EventError>;

/// An event as handed over by the transport: authenticated, unencrypted,
/// but otherwise untrusted.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub origin_server_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: JSValue,
}

impl RawEvent {
    /// The event id when the transport provides one, otherwise a digest of
    /// the whole event. Two deliveries of the same event share their identity.
    pub fn identity(&self) -> String {
        match &self.event_id {
            Some(event_id) => event_id.clone(),
            None => {
                let serialized = serde_json::to_string(self).unwrap_or_default();
                format!("sha256:{}", sha256::digest(serialized.as_str()))
            }
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct EventMeta {
    pub room_id: String,
    pub sender: String,
    pub origin_server_ts: u64,
    pub identity: String,
}

impl EventMeta {
    pub fn from_raw(raw: &RawEvent) -> EventMeta {
        EventMeta {
            room_id: raw.room_id.clone(),
            sender: raw.sender.clone(),
            origin_server_ts: raw.origin_server_ts,
            identity: raw.identity(),
        }
    }

    /// Later timestamp first, then the smaller sender, then the smaller identity.
    fn order_key(&self) -> (u64, Reverse<&str>, Reverse<&str>) {
        (
            self.origin_server_ts,
            Reverse(self.sender.as_str()),
            Reverse(self.identity.as_str()),
        )
    }

    /// Whether this event replaces `other` when both address the same key.
    ///
    /// The order is total, so every replica keeps the same event whatever the
    /// delivery order was.
    pub fn supersedes(&self, other: &EventMeta) -> bool {
        self.order_key() > other.order_key()
    }
}

/// A validated event in the current schema, ready for the store.
#[derive(PartialEq, Debug, Clone)]
pub struct CanonicalEvent {
    pub meta: EventMeta,
    /// State key of state events, empty for votes.
    pub state_key: String,
    pub payload: Canonical,
}

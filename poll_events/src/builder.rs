use serde::Serialize;
use serde_json::json;
use serde_json::Value as JSValue;

use crate::config::*;
use crate::events::*;

/// A builder for raw room events.
///
/// It stamps every event with the room, a strictly increasing timestamp and
/// a unique event id, which is what hosts and tests need to produce streams
/// that the store can order.
///
/// ```
/// use poll_events::builder::EventBuilder;
/// use poll_events::*;
///
/// let mut builder = EventBuilder::new("!room:example.org");
/// let poll = PollContent::new(
///     "Lunch",
///     &[("a", "Pizza"), ("b", "Salad")],
///     PollType::Open,
///     ResultType::Visible,
/// );
///
/// let mut store = PollStore::new("!room:example.org");
/// ingest(&mut store, &builder.poll("@mod:example.org", "p1", &poll)?)?;
/// ingest(&mut store, &builder.vote("@alice:example.org", "p1", "b")?)?;
/// assert_eq!(store.votes_for("p1").count(), 1);
///
/// # Ok::<(), EventError>(())
/// ```
pub struct EventBuilder {
    room_id: String,
    next_ts: u64,
    counter: u64,
}

impl EventBuilder {
    pub fn new(room_id: &str) -> EventBuilder {
        EventBuilder {
            room_id: room_id.to_string(),
            next_ts: 1_000,
            counter: 0,
        }
    }

    /// Sets the timestamp of the next event. The following ones keep
    /// counting up from there.
    pub fn at(&mut self, origin_server_ts: u64) -> &mut Self {
        self.next_ts = origin_server_ts;
        self
    }

    /// An event with an arbitrary type and content, as a transport would
    /// deliver it. Nothing is checked.
    pub fn raw(
        &mut self,
        event_type: &str,
        sender: &str,
        state_key: Option<&str>,
        content: JSValue,
    ) -> RawEvent {
        let ts = self.next_ts;
        self.next_ts += 1;
        self.counter += 1;
        RawEvent {
            event_type: event_type.to_string(),
            room_id: self.room_id.clone(),
            sender: sender.to_string(),
            event_id: Some(format!("${}-{}", ts, self.counter)),
            origin_server_ts: ts,
            state_key: state_key.map(|s| s.to_string()),
            content,
        }
    }

    fn state<T: Serialize>(
        &mut self,
        kind: EventKind,
        sender: &str,
        state_key: &str,
        content: &T,
    ) -> EventResult<RawEvent> {
        let content = serde_json::to_value(content).map_err(|e| EventError::Canonicalize {
            kind,
            message: e.to_string(),
        })?;
        Ok(self.raw(kind.event_type(), sender, Some(state_key), content))
    }

    pub fn group(
        &mut self,
        sender: &str,
        group_id: &str,
        content: &GroupContent,
    ) -> EventResult<RawEvent> {
        self.state(EventKind::Group, sender, group_id, content)
    }

    pub fn poll(
        &mut self,
        sender: &str,
        poll_id: &str,
        content: &PollContent,
    ) -> EventResult<RawEvent> {
        self.state(EventKind::Poll, sender, poll_id, content)
    }

    /// Settings for a group, or for the whole room with an empty `scope`.
    pub fn settings(
        &mut self,
        sender: &str,
        scope: &str,
        content: &PollSettingsContent,
    ) -> EventResult<RawEvent> {
        self.state(EventKind::PollSettings, sender, scope, content)
    }

    pub fn room_name(&mut self, sender: &str, name: &str) -> EventResult<RawEvent> {
        let content = RoomNameContent {
            schema_version: crate::migrate::current_version(EventKind::RoomName),
            name: name.to_string(),
        };
        self.state(EventKind::RoomName, sender, "", &content)
    }

    pub fn vote(&mut self, sender: &str, poll_id: &str, answer_id: &str) -> EventResult<RawEvent> {
        let content = json!({
            "schemaVersion": crate::migrate::current_version(EventKind::Vote),
            "pollId": poll_id,
            "answerId": answer_id,
        });
        Ok(self.raw(ROOM_EVENT_VOTE, sender, None, content))
    }
}

// Shape checks for incoming payloads, per event kind and declared schema version.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;
use snafu::prelude::*;

use crate::config::{MemberRole, PollType, ResultType};
use crate::events::*;
use crate::migrate;

/// A payload whose shape matches its declared schema version.
#[derive(PartialEq, Debug, Clone)]
pub struct ValidatedPayload {
    pub kind: EventKind,
    pub version: u32,
    pub content: JSMap<String, JSValue>,
}

#[derive(PartialEq, Debug, Clone)]
pub struct ValidatedEvent {
    pub meta: EventMeta,
    pub state_key: String,
    pub payload: ValidatedPayload,
}

/// Checks the payload of one event against the shape of its declared version.
///
/// Cross-entity references (does the poll of a vote exist, is the answer
/// still offered) are not checked here: they are resolved at tally time.
pub fn validate(kind: EventKind, payload: &JSValue) -> EventResult<ValidatedPayload> {
    let content = payload.as_object().context(InvalidFieldSnafu {
        kind,
        field: "content",
        expected: "an object",
    })?;
    let version = declared_version(kind, content)?;
    let fields = Fields::new(kind, content);
    match kind {
        EventKind::Group => check_group(&fields, version)?,
        EventKind::Poll => check_poll(&fields, version)?,
        EventKind::PollSettings => check_settings(&fields, version)?,
        EventKind::Vote => check_vote(&fields)?,
        EventKind::RoomName => {
            fields.string("name")?;
        }
    }
    debug!("validate: {} payload at version {} accepted", kind, version);
    Ok(ValidatedPayload {
        kind,
        version,
        content: content.clone(),
    })
}

/// Validates a full event: its type, its entity key and its payload.
pub fn validate_event(raw: &RawEvent) -> EventResult<ValidatedEvent> {
    let kind = EventKind::from_event_type(&raw.event_type).context(UnknownEventTypeSnafu {
        event_type: raw.event_type.clone(),
    })?;
    let state_key = entity_key(kind, raw)?;
    let payload = validate(kind, &raw.content)?;
    Ok(ValidatedEvent {
        meta: EventMeta::from_raw(raw),
        state_key,
        payload,
    })
}

fn entity_key(kind: EventKind, raw: &RawEvent) -> EventResult<String> {
    if !kind.is_state() {
        return Ok(String::new());
    }
    let key = raw.state_key.as_deref().context(MissingFieldSnafu {
        kind,
        field: "state_key",
    })?;
    // Groups and polls are addressed by their state key. Settings use the
    // empty key for the room-wide scope. The room has one name.
    match kind {
        EventKind::Group | EventKind::Poll => ensure!(
            !key.is_empty(),
            InvalidFieldSnafu {
                kind,
                field: "state_key",
                expected: "a non-empty entity id",
            }
        ),
        EventKind::RoomName => ensure!(
            key.is_empty(),
            InvalidFieldSnafu {
                kind,
                field: "state_key",
                expected: "the empty key",
            }
        ),
        _ => {}
    }
    Ok(key.to_string())
}

fn declared_version(kind: EventKind, content: &JSMap<String, JSValue>) -> EventResult<u32> {
    let declared = match content.get(SCHEMA_VERSION_FIELD) {
        // m.room.name is a protocol event: it does not carry our version field.
        None if kind == EventKind::RoomName => return Ok(1),
        None => {
            return MissingFieldSnafu {
                kind,
                field: SCHEMA_VERSION_FIELD,
            }
            .fail()
        }
        Some(v) => v.as_u64().context(InvalidFieldSnafu {
            kind,
            field: SCHEMA_VERSION_FIELD,
            expected: "a positive integer",
        })?,
    };
    let supported = migrate::supported_versions(kind);
    u32::try_from(declared)
        .ok()
        .filter(|v| supported.contains(v))
        .context(UnsupportedVersionSnafu {
            kind,
            version: declared,
        })
}

/// Matrix user ids: `@localpart:server`.
pub fn is_user_id(s: &str) -> bool {
    match (s.strip_prefix('@'), s.find(':')) {
        (Some(_), Some(idx)) => idx > 1 && idx < s.len() - 1,
        _ => false,
    }
}

fn check_group(fields: &Fields, version: u32) -> EventResult<()> {
    fields.string("name")?;
    if let Some(poll_ids) = fields.optional_array("pollIds")? {
        for (idx, _) in poll_ids.iter().enumerate() {
            fields.element(poll_ids, "pollIds", idx).non_empty_string()?;
        }
    }
    if version == 1 {
        let members = fields.array("members")?;
        for (idx, _) in members.iter().enumerate() {
            fields.element(members, "members", idx).user_id()?;
        }
    } else {
        let members = fields.object("members")?;
        for (user_id, member) in members.iter() {
            ensure!(
                is_user_id(user_id),
                InvalidFieldSnafu {
                    kind: fields.kind,
                    field: format!("members.{}", user_id),
                    expected: "a user id like @name:server",
                }
            );
            let path = format!("members.{}", user_id);
            let member = fields.nested(member, &path)?;
            member.enum_value("memberRole", &MemberRole::VARIANTS)?;
        }
    }
    Ok(())
}

fn check_poll(fields: &Fields, version: u32) -> EventResult<()> {
    fields.string("title")?;
    fields.optional_string("question")?;
    fields.enum_value("pollType", &PollType::VARIANTS)?;
    if version < 3 {
        fields.enum_value("resultType", &ResultType::LEGACY_VARIANTS)?;
    } else {
        fields.enum_value("resultType", &ResultType::VARIANTS)?;
    }

    let answers = fields.array("answers")?;
    ensure!(
        !answers.is_empty(),
        InvalidFieldSnafu {
            kind: fields.kind,
            field: "answers",
            expected: "at least one answer",
        }
    );
    if version == 1 {
        // Plain labels, the ids are assigned by the migration.
        for (idx, _) in answers.iter().enumerate() {
            fields.element(answers, "answers", idx).string_value()?;
        }
    } else {
        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, answer) in answers.iter().enumerate() {
            let answer = fields.nested(answer, &format!("answers[{}]", idx))?;
            let id = answer.non_empty_string("id")?;
            answer.string("label")?;
            ensure!(
                seen.insert(id),
                DuplicateAnswerIdSnafu {
                    answer_id: id.to_string()
                }
            );
        }
    }

    if let Some(minutes) = fields.optional_u64("duration")? {
        ensure!(
            u32::try_from(minutes).is_ok(),
            InvalidFieldSnafu {
                kind: fields.kind,
                field: "duration",
                expected: "a number of minutes",
            }
        );
    }
    fields.optional_timestamp("startTime")?;
    if version >= 3 {
        fields.optional_timestamp("endTime")?;
    }
    Ok(())
}

fn check_settings(fields: &Fields, version: u32) -> EventResult<()> {
    fields.optional_u64("pdfButtonDisabledAfter")?;
    if version >= 2 {
        let roles = fields.array("pollCreatorRoles")?;
        for (idx, _) in roles.iter().enumerate() {
            fields
                .element(roles, "pollCreatorRoles", idx)
                .enum_variant(&MemberRole::VARIANTS)?;
        }
    }
    Ok(())
}

fn check_vote(fields: &Fields) -> EventResult<()> {
    fields.non_empty_string("pollId")?;
    fields.non_empty_string("answerId")?;
    Ok(())
}

/// Typed access to the fields of one JSON object, reporting errors with the
/// path of the offending field.
struct Fields<'a> {
    kind: EventKind,
    prefix: String,
    content: &'a JSMap<String, JSValue>,
}

impl<'a> Fields<'a> {
    fn new(kind: EventKind, content: &'a JSMap<String, JSValue>) -> Fields<'a> {
        Fields {
            kind,
            prefix: String::new(),
            content,
        }
    }

    fn path(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    fn invalid<T>(&self, field: &str, expected: &str) -> EventResult<T> {
        InvalidFieldSnafu {
            kind: self.kind,
            field: self.path(field),
            expected,
        }
        .fail()
    }

    fn nested(&self, value: &'a JSValue, path: &str) -> EventResult<Fields<'a>> {
        match value.as_object() {
            Some(content) => Ok(Fields {
                kind: self.kind,
                prefix: format!("{}{}.", self.prefix, path),
                content,
            }),
            None => self.invalid(path, "an object"),
        }
    }

    fn element(&self, items: &'a [JSValue], field: &str, idx: usize) -> Element<'a> {
        Element {
            kind: self.kind,
            path: format!("{}[{}]", self.path(field), idx),
            value: &items[idx],
        }
    }

    /// Absent and null fields are treated alike.
    fn optional(&self, field: &str) -> Option<&'a JSValue> {
        match self.content.get(field) {
            None | Some(JSValue::Null) => None,
            Some(v) => Some(v),
        }
    }

    fn get(&self, field: &str) -> EventResult<&'a JSValue> {
        self.optional(field).context(MissingFieldSnafu {
            kind: self.kind,
            field: self.path(field),
        })
    }

    fn string(&self, field: &str) -> EventResult<&'a str> {
        match self.get(field)?.as_str() {
            Some(s) => Ok(s),
            None => self.invalid(field, "a string"),
        }
    }

    fn non_empty_string(&self, field: &str) -> EventResult<&'a str> {
        match self.string(field)? {
            "" => self.invalid(field, "a non-empty string"),
            s => Ok(s),
        }
    }

    fn optional_string(&self, field: &str) -> EventResult<Option<&'a str>> {
        match self.optional(field) {
            None => Ok(None),
            Some(_) => self.string(field).map(Some),
        }
    }

    fn array(&self, field: &str) -> EventResult<&'a Vec<JSValue>> {
        match self.get(field)?.as_array() {
            Some(items) => Ok(items),
            None => self.invalid(field, "a list"),
        }
    }

    fn optional_array(&self, field: &str) -> EventResult<Option<&'a Vec<JSValue>>> {
        match self.optional(field) {
            None => Ok(None),
            Some(_) => self.array(field).map(Some),
        }
    }

    fn object(&self, field: &str) -> EventResult<&'a JSMap<String, JSValue>> {
        match self.get(field)?.as_object() {
            Some(content) => Ok(content),
            None => self.invalid(field, "an object"),
        }
    }

    fn optional_u64(&self, field: &str) -> EventResult<Option<u64>> {
        match self.optional(field) {
            None => Ok(None),
            Some(v) => match v.as_u64() {
                Some(n) => Ok(Some(n)),
                None => self.invalid(field, "a non-negative integer"),
            },
        }
    }

    fn optional_timestamp(&self, field: &str) -> EventResult<Option<DateTime<Utc>>> {
        match self.optional_string(field)? {
            None => Ok(None),
            Some(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
                Err(_) => self.invalid(field, "an RFC 3339 timestamp"),
            },
        }
    }

    fn enum_value<T: Copy>(&self, field: &str, variants: &[(&str, T)]) -> EventResult<T> {
        let value = self.string(field)?;
        Element {
            kind: self.kind,
            path: self.path(field),
            value: self.get(field)?,
        }
        .lookup(value, variants)
    }
}

/// One element of a list field.
struct Element<'a> {
    kind: EventKind,
    path: String,
    value: &'a JSValue,
}

impl<'a> Element<'a> {
    fn string_value(&self) -> EventResult<&'a str> {
        self.value.as_str().context(InvalidFieldSnafu {
            kind: self.kind,
            field: self.path.clone(),
            expected: "a string",
        })
    }

    fn non_empty_string(&self) -> EventResult<&'a str> {
        let s = self.string_value()?;
        ensure!(
            !s.is_empty(),
            InvalidFieldSnafu {
                kind: self.kind,
                field: self.path.clone(),
                expected: "a non-empty string",
            }
        );
        Ok(s)
    }

    fn user_id(&self) -> EventResult<&'a str> {
        let s = self.string_value()?;
        ensure!(
            is_user_id(s),
            InvalidFieldSnafu {
                kind: self.kind,
                field: self.path.clone(),
                expected: "a user id like @name:server",
            }
        );
        Ok(s)
    }

    fn enum_variant<T: Copy>(&self, variants: &[(&str, T)]) -> EventResult<T> {
        let s = self.string_value()?;
        self.lookup(s, variants)
    }

    fn lookup<T: Copy>(&self, value: &str, variants: &[(&str, T)]) -> EventResult<T> {
        variants
            .iter()
            .find(|(name, _)| *name == value)
            .map(|(_, v)| *v)
            .context(InvalidEnumValueSnafu {
                kind: self.kind,
                field: self.path.clone(),
                value,
            })
    }
}

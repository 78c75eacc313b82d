// ********* Canonical payloads ***********

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The role of a member inside a poll group.
///
/// Roles decide both who may vote (see [`TallyRules::voting_roles`]) and who
/// may create polls (see [`PollSettingsContent::poll_creator_roles`]).
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Moderator,
    Participant,
    Observer,
}

impl MemberRole {
    pub const VARIANTS: [(&'static str, MemberRole); 3] = [
        ("moderator", MemberRole::Moderator),
        ("participant", MemberRole::Participant),
        ("observer", MemberRole::Observer),
    ];

    pub fn parse(s: &str) -> Option<MemberRole> {
        Self::VARIANTS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, role)| *role)
    }
}

/// Who can see what while a poll is running.
///
/// - `Open`: voter identities and their choices are always visible.
/// - `Disclosed`: who voted is visible, the choice of each voter is only
/// revealed once the poll has ended.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollType {
    Open,
    Disclosed,
}

impl PollType {
    pub const VARIANTS: [(&'static str, PollType); 2] =
        [("open", PollType::Open), ("disclosed", PollType::Disclosed)];
}

/// When the per-answer tally may be computed.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// The running tally is available at any time.
    Visible,
    /// Only the number of cast votes is available until the poll ends.
    Hidden,
}

impl ResultType {
    pub const VARIANTS: [(&'static str, ResultType); 2] = [
        ("visible", ResultType::Visible),
        ("hidden", ResultType::Hidden),
    ];
    /// Spelling used before schema version 3 of the poll event.
    pub const LEGACY_VARIANTS: [(&'static str, ResultType); 2] = [
        ("visible", ResultType::Visible),
        ("invisible", ResultType::Hidden),
    ];
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberContent {
    pub member_role: MemberRole,
}

/// A named set of polls sharing a member roster.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContent {
    pub schema_version: u32,
    pub name: String,
    /// Polls of this group, in display order.
    #[serde(default)]
    pub poll_ids: Vec<String>,
    pub members: BTreeMap<String, MemberContent>,
}

impl GroupContent {
    pub fn new(name: &str, poll_ids: &[&str], members: &[(&str, MemberRole)]) -> GroupContent {
        GroupContent {
            schema_version: crate::migrate::current_version(crate::EventKind::Group),
            name: name.to_string(),
            poll_ids: poll_ids.iter().map(|id| id.to_string()).collect(),
            members: members
                .iter()
                .map(|(user, role)| (user.to_string(), MemberContent { member_role: *role }))
                .collect(),
        }
    }

    pub fn role_of(&self, user_id: &str) -> Option<MemberRole> {
        self.members.get(user_id).map(|m| m.member_role)
    }

    pub fn references(&self, poll_id: &str) -> bool {
        self.poll_ids.iter().any(|id| id == poll_id)
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PollAnswer {
    pub id: String,
    pub label: String,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollContent {
    pub schema_version: u32,
    pub title: String,
    #[serde(default)]
    pub question: String,
    pub answers: Vec<PollAnswer>,
    pub poll_type: PollType,
    pub result_type: ResultType,
    /// Length of the poll in minutes, counted from `start_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl PollContent {
    pub fn new(
        title: &str,
        answers: &[(&str, &str)],
        poll_type: PollType,
        result_type: ResultType,
    ) -> PollContent {
        PollContent {
            schema_version: crate::migrate::current_version(crate::EventKind::Poll),
            title: title.to_string(),
            question: String::new(),
            answers: answers
                .iter()
                .map(|(id, label)| PollAnswer {
                    id: id.to_string(),
                    label: label.to_string(),
                })
                .collect(),
            poll_type,
            result_type,
            duration: None,
            start_time: None,
            end_time: None,
        }
    }

    /// The end of the poll: the explicit end time, or the start time plus
    /// the duration. A poll that was never started does not end.
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.end_time
            .or_else(|| match (self.start_time, self.duration) {
                (Some(start), Some(minutes)) => {
                    start.checked_add_signed(Duration::minutes(i64::from(minutes)))
                }
                _ => None,
            })
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at().map_or(false, |end| now >= end)
    }

    pub fn answer(&self, answer_id: &str) -> Option<&PollAnswer> {
        self.answers.iter().find(|a| a.id == answer_id)
    }
}

/// Settings for the whole room (empty scope) or for one group.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSettingsContent {
    pub schema_version: u32,
    /// Epoch milliseconds from which exporting results is no longer offered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_button_disabled_after: Option<u64>,
    pub poll_creator_roles: Vec<MemberRole>,
}

impl Default for PollSettingsContent {
    fn default() -> Self {
        PollSettingsContent {
            schema_version: crate::migrate::current_version(crate::EventKind::PollSettings),
            pdf_button_disabled_after: None,
            poll_creator_roles: vec![MemberRole::Moderator],
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteContent {
    pub schema_version: u32,
    pub poll_id: String,
    pub answer_id: String,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomNameContent {
    pub schema_version: u32,
    pub name: String,
}

// ******** Output data structures *********

#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerTally {
    pub answer_id: String,
    pub label: String,
    pub count: u64,
    /// The voters behind this count, when the poll type lets them be seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voters: Option<Vec<String>>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Tally {
    /// Hidden result of a running poll: only the cast count is known.
    Withheld,
    Counted {
        /// In the answer order of the poll.
        answers: Vec<AnswerTally>,
        /// All the answers sharing the highest count. Empty when nobody voted.
        winners: Vec<String>,
    },
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub voter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_id: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub eligible: Vec<String>,
    pub not_voted: Vec<String>,
    /// Votes from identities without a voting right. They are kept in the
    /// store and count again if the right is restored.
    pub ineligible_votes: usize,
    /// Votes for an answer id the poll does not offer.
    pub unknown_answer_votes: usize,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub room_id: String,
    pub poll_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub poll_type: PollType,
    pub result_type: ResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub eligible_voters: usize,
    pub cast_votes: usize,
    pub tally: Tally,
    pub participation: Vec<Participation>,
    pub eligibility: Eligibility,
}

impl PollResult {
    /// The per-answer counts, if they may be shown.
    pub fn counts(&self) -> Option<Vec<(String, u64)>> {
        match &self.tally {
            Tally::Withheld => None,
            Tally::Counted { answers, .. } => Some(
                answers
                    .iter()
                    .map(|a| (a.answer_id.clone(), a.count))
                    .collect(),
            ),
        }
    }
}

// ********* Configuration **********

/// Eligibility for polls that no group references.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum UngroupedPolicy {
    /// Anyone who voted is an eligible voter.
    AnyVoter,
    /// No vote counts.
    NoVoters,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct TallyRules {
    /// Group roles that carry a voting right.
    pub voting_roles: Vec<MemberRole>,
    pub ungrouped: UngroupedPolicy,
}

impl TallyRules {
    pub fn grants_voting_right(&self, role: MemberRole) -> bool {
        self.voting_roles.contains(&role)
    }
}

impl Default for TallyRules {
    fn default() -> Self {
        TallyRules {
            voting_roles: vec![MemberRole::Moderator, MemberRole::Participant],
            ungrouped: UngroupedPolicy::AnyVoter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn poll_end() {
        let mut poll = PollContent::new("T", &[("a", "A")], PollType::Open, ResultType::Visible);
        assert_eq!(poll.ends_at(), None);
        assert!(!poll.has_ended(utc("2100-01-01T00:00:00Z")));

        poll.start_time = Some(utc("2024-05-01T10:00:00Z"));
        poll.duration = Some(90);
        assert_eq!(poll.ends_at(), Some(utc("2024-05-01T11:30:00Z")));
        assert!(!poll.has_ended(utc("2024-05-01T11:29:59Z")));
        assert!(poll.has_ended(utc("2024-05-01T11:30:00Z")));

        // An explicit end wins over the duration.
        poll.end_time = Some(utc("2024-05-01T10:15:00Z"));
        assert_eq!(poll.ends_at(), Some(utc("2024-05-01T10:15:00Z")));
    }

    #[test]
    fn roles() {
        assert_eq!(MemberRole::parse("observer"), Some(MemberRole::Observer));
        assert_eq!(MemberRole::parse("Moderator"), None);
        let rules = TallyRules::default();
        assert!(rules.grants_voting_right(MemberRole::Participant));
        assert!(!rules.grants_voting_right(MemberRole::Observer));
    }

    #[test]
    fn tally_wire_shape() {
        assert_eq!(
            serde_json::to_value(&Tally::Withheld).unwrap(),
            json!({"status": "withheld"})
        );
        let counted = Tally::Counted {
            answers: vec![AnswerTally {
                answer_id: "a".to_string(),
                label: "A".to_string(),
                count: 2,
                voters: None,
            }],
            winners: vec!["a".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&counted).unwrap(),
            json!({
                "status": "counted",
                "answers": [{"answerId": "a", "label": "A", "count": 2}],
                "winners": ["a"]
            })
        );
    }
}

// Derivation of a poll result from the content of a store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::config::*;
use crate::store::PollStore;

/// Computes the result of a poll at time `now`.
///
/// Returns `None` if the poll is not known (yet): its votes stay in the store
/// and count as soon as the poll arrives.
///
/// Arguments:
/// * `poll_id` the poll to tally
/// * `store` the state of the room of the poll
/// * `rules` which roles vote and what to do with polls of no group
/// * `now` decides whether the poll has ended
pub fn aggregate(
    poll_id: &str,
    store: &PollStore,
    rules: &TallyRules,
    now: DateTime<Utc>,
) -> Option<PollResult> {
    let is_final = store.poll(poll_id)?.content.has_ended(now);
    tally_poll(poll_id, store, rules, is_final)
}

pub(crate) fn tally_poll(
    poll_id: &str,
    store: &PollStore,
    rules: &TallyRules,
    is_final: bool,
) -> Option<PollResult> {
    let poll = &store.poll(poll_id)?.content;
    let group = store.group_for_poll(poll_id);

    let eligible: BTreeSet<String> = match group {
        Some((_, group)) => group
            .members
            .iter()
            .filter(|(_, member)| rules.grants_voting_right(member.member_role))
            .map(|(user, _)| user.clone())
            .collect(),
        None => match rules.ungrouped {
            UngroupedPolicy::AnyVoter => store
                .votes_for(poll_id)
                .map(|(voter, _)| voter.to_string())
                .collect(),
            UngroupedPolicy::NoVoters => BTreeSet::new(),
        },
    };

    // Ineligible votes and votes for withdrawn answers are skipped, not
    // removed: they count again once the voter or the answer comes back.
    let mut ballots: Vec<(&str, &str)> = Vec::new();
    let mut ineligible_votes: usize = 0;
    let mut unknown_answer_votes: usize = 0;
    for (voter, vote) in store.votes_for(poll_id) {
        if !eligible.contains(voter) {
            ineligible_votes += 1;
        } else if poll.answer(&vote.answer_id).is_none() {
            unknown_answer_votes += 1;
        } else {
            ballots.push((voter, vote.answer_id.as_str()));
        }
    }
    debug!(
        "tally_poll: {} counted ballots, {} ineligible, {} for unknown answers",
        ballots.len(),
        ineligible_votes,
        unknown_answer_votes
    );

    let mut per_answer: BTreeMap<&str, Vec<&str>> = poll
        .answers
        .iter()
        .map(|a| (a.id.as_str(), Vec::new()))
        .collect();
    for (voter, answer_id) in ballots.iter() {
        if let Some(voters) = per_answer.get_mut(answer_id) {
            voters.push(*voter);
        }
    }

    let choices_visible = poll.poll_type == PollType::Open || is_final;
    let tally = if poll.result_type == ResultType::Hidden && !is_final {
        Tally::Withheld
    } else {
        let answers: Vec<AnswerTally> = poll
            .answers
            .iter()
            .map(|a| {
                let voters = per_answer.get(a.id.as_str()).cloned().unwrap_or_default();
                AnswerTally {
                    answer_id: a.id.clone(),
                    label: a.label.clone(),
                    count: voters.len() as u64,
                    voters: if choices_visible {
                        Some(voters.iter().map(|v| v.to_string()).collect())
                    } else {
                        None
                    },
                }
            })
            .collect();
        let winners = find_winners(&answers);
        Tally::Counted { answers, winners }
    };

    let participation: Vec<Participation> = ballots
        .iter()
        .map(|(voter, answer_id)| Participation {
            voter: voter.to_string(),
            answer_id: if choices_visible {
                Some(answer_id.to_string())
            } else {
                None
            },
        })
        .collect();

    let voted: BTreeSet<&str> = ballots.iter().map(|(voter, _)| *voter).collect();
    let not_voted: Vec<String> = eligible
        .iter()
        .filter(|user| !voted.contains(user.as_str()))
        .cloned()
        .collect();

    let res = PollResult {
        room_id: store.room_id().to_string(),
        poll_id: poll_id.to_string(),
        title: poll.title.clone(),
        group_id: group.map(|(id, _)| id.to_string()),
        poll_type: poll.poll_type,
        result_type: poll.result_type,
        ends_at: poll.ends_at(),
        is_final,
        eligible_voters: eligible.len(),
        cast_votes: ballots.len(),
        tally,
        participation,
        eligibility: Eligibility {
            eligible: eligible.into_iter().collect(),
            not_voted,
            ineligible_votes,
            unknown_answer_votes,
        },
    };
    info!(
        "Poll {} in {}: {} of {} eligible voters voted (final: {})",
        res.poll_id, res.room_id, res.cast_votes, res.eligible_voters, res.is_final
    );
    Some(res)
}

/// All the answers with the highest count. Ties are not broken.
fn find_winners(answers: &[AnswerTally]) -> Vec<String> {
    let max_count = answers.iter().map(|a| a.count).max().unwrap_or(0);
    if max_count == 0 {
        return Vec::new();
    }
    answers
        .iter()
        .filter(|a| a.count == max_count)
        .map(|a| a.answer_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EventBuilder;
    use crate::events::RawEvent;
    use crate::ingest;

    const ROOM: &str = "!room:example.org";

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn before_end() -> DateTime<Utc> {
        utc("2024-05-01T10:30:00Z")
    }

    fn after_end() -> DateTime<Utc> {
        utc("2024-05-01T11:00:00Z")
    }

    fn poll_content(poll_type: PollType, result_type: ResultType) -> PollContent {
        let mut poll = PollContent::new("Lunch", &[("A", "Pizza"), ("B", "Salad")], poll_type, result_type);
        poll.start_time = Some(utc("2024-05-01T10:00:00Z"));
        poll.end_time = Some(utc("2024-05-01T11:00:00Z"));
        poll
    }

    fn board(members: &[(&str, MemberRole)]) -> GroupContent {
        GroupContent::new("Board", &["p1"], members)
    }

    fn everyone() -> GroupContent {
        board(&[
            ("@u1:x", MemberRole::Participant),
            ("@u2:x", MemberRole::Participant),
            ("@u3:x", MemberRole::Moderator),
        ])
    }

    /// Poll p1 with answers A and B, voters u1..u3 all eligible, and the votes
    /// u1 -> A, u2 -> B, u3 -> A, then u1 -> B.
    fn scenario(poll_type: PollType, result_type: ResultType) -> Vec<RawEvent> {
        let mut b = EventBuilder::new(ROOM);
        vec![
            b.poll("@u3:x", "p1", &poll_content(poll_type, result_type)).unwrap(),
            b.group("@u3:x", "g1", &everyone()).unwrap(),
            b.vote("@u1:x", "p1", "A").unwrap(),
            b.vote("@u2:x", "p1", "B").unwrap(),
            b.vote("@u3:x", "p1", "A").unwrap(),
            b.vote("@u1:x", "p1", "B").unwrap(),
        ]
    }

    fn store_with(events: &[RawEvent]) -> PollStore {
        let mut store = PollStore::new(ROOM);
        for e in events {
            let _ = ingest(&mut store, e);
        }
        store
    }

    fn counts(pairs: &[(&str, u64)]) -> Option<Vec<(String, u64)>> {
        Some(pairs.iter().map(|(id, c)| (id.to_string(), *c)).collect())
    }

    #[test]
    fn revote_replaces_the_first_vote() {
        let store = store_with(&scenario(PollType::Open, ResultType::Visible));
        let res = aggregate("p1", &store, &TallyRules::default(), before_end()).unwrap();
        assert_eq!(res.counts(), counts(&[("A", 1), ("B", 2)]));
        assert_eq!(res.cast_votes, 3);
        assert_eq!(res.eligible_voters, 3);
        assert!(!res.is_final);
        assert_eq!(res.group_id.as_deref(), Some("g1"));
        match res.tally {
            Tally::Counted { answers, winners } => {
                assert_eq!(winners, vec!["B".to_string()]);
                assert_eq!(answers[1].voters, Some(vec!["@u1:x".to_string(), "@u2:x".to_string()]));
            }
            Tally::Withheld => panic!("visible results are counted"),
        }
    }

    #[test]
    fn hidden_results_until_the_end() {
        let store = store_with(&scenario(PollType::Open, ResultType::Hidden));
        let running = aggregate("p1", &store, &TallyRules::default(), before_end()).unwrap();
        assert_eq!(running.tally, Tally::Withheld);
        assert_eq!(running.counts(), None);
        assert_eq!(running.cast_votes, 3);
        // Open polls still show who chose what.
        assert_eq!(running.participation[0].answer_id.as_deref(), Some("B"));

        let ended = aggregate("p1", &store, &TallyRules::default(), after_end()).unwrap();
        assert!(ended.is_final);
        assert_eq!(ended.counts(), counts(&[("A", 1), ("B", 2)]));
    }

    #[test]
    fn disclosed_polls_hide_choices_until_the_end() {
        let store = store_with(&scenario(PollType::Disclosed, ResultType::Visible));
        let running = aggregate("p1", &store, &TallyRules::default(), before_end()).unwrap();
        let voters: Vec<&str> = running.participation.iter().map(|p| p.voter.as_str()).collect();
        assert_eq!(voters, vec!["@u1:x", "@u2:x", "@u3:x"]);
        assert!(running.participation.iter().all(|p| p.answer_id.is_none()));
        match &running.tally {
            Tally::Counted { answers, .. } => assert!(answers.iter().all(|a| a.voters.is_none())),
            Tally::Withheld => panic!("visible results are counted"),
        }

        let ended = aggregate("p1", &store, &TallyRules::default(), after_end()).unwrap();
        assert!(ended.participation.iter().all(|p| p.answer_id.is_some()));
    }

    #[test]
    fn vote_order_does_not_matter() {
        let events = scenario(PollType::Open, ResultType::Visible);
        let expected = aggregate("p1", &store_with(&events), &TallyRules::default(), after_end());
        let mut reversed = events.clone();
        reversed.reverse();
        let mut rotated = events.clone();
        rotated.rotate_left(3);
        for permutation in [reversed, rotated] {
            let res = aggregate(
                "p1",
                &store_with(&permutation),
                &TallyRules::default(),
                after_end(),
            );
            assert_eq!(res, expected);
        }
    }

    #[test]
    fn removed_members_are_excluded_then_restored() {
        let mut events = scenario(PollType::Open, ResultType::Visible);
        let mut b = EventBuilder::new(ROOM);
        b.at(10_000);
        let without_u2 = board(&[("@u1:x", MemberRole::Participant), ("@u3:x", MemberRole::Moderator)]);
        events.push(b.group("@u3:x", "g1", &without_u2).unwrap());
        let mut store = store_with(&events);

        let res = aggregate("p1", &store, &TallyRules::default(), after_end()).unwrap();
        assert_eq!(res.counts(), counts(&[("A", 1), ("B", 1)]));
        assert_eq!(res.eligibility.ineligible_votes, 1);
        assert_eq!(res.eligible_voters, 2);

        ingest(&mut store, &b.group("@u3:x", "g1", &everyone()).unwrap()).unwrap();
        let res = aggregate("p1", &store, &TallyRules::default(), after_end()).unwrap();
        assert_eq!(res.counts(), counts(&[("A", 1), ("B", 2)]));
        assert_eq!(res.eligibility.ineligible_votes, 0);
    }

    #[test]
    fn observers_do_not_vote() {
        let mut b = EventBuilder::new(ROOM);
        let events = vec![
            b.poll("@m:x", "p1", &poll_content(PollType::Open, ResultType::Visible)).unwrap(),
            b.group(
                "@m:x",
                "g1",
                &board(&[("@m:x", MemberRole::Moderator), ("@o:x", MemberRole::Observer)]),
            )
            .unwrap(),
            b.vote("@o:x", "p1", "A").unwrap(),
        ];
        let res = aggregate("p1", &store_with(&events), &TallyRules::default(), after_end()).unwrap();
        assert_eq!(res.cast_votes, 0);
        assert_eq!(res.eligibility.eligible, vec!["@m:x".to_string()]);
        assert_eq!(res.eligibility.not_voted, vec!["@m:x".to_string()]);
        assert_eq!(res.eligibility.ineligible_votes, 1);
    }

    #[test]
    fn withdrawn_answers_do_not_count() {
        let mut events = scenario(PollType::Open, ResultType::Visible);
        let mut b = EventBuilder::new(ROOM);
        b.at(10_000);
        let mut only_a = poll_content(PollType::Open, ResultType::Visible);
        only_a.answers.truncate(1);
        events.push(b.poll("@u3:x", "p1", &only_a).unwrap());
        let res = aggregate("p1", &store_with(&events), &TallyRules::default(), after_end()).unwrap();
        assert_eq!(res.counts(), counts(&[("A", 1)]));
        assert_eq!(res.cast_votes, 1);
        assert_eq!(res.eligibility.unknown_answer_votes, 2);
        assert_eq!(res.eligibility.not_voted, vec!["@u1:x".to_string(), "@u2:x".to_string()]);
    }

    #[test]
    fn ties_are_reported_as_co_winners() {
        let mut b = EventBuilder::new(ROOM);
        let events = vec![
            b.poll("@u3:x", "p1", &poll_content(PollType::Open, ResultType::Visible)).unwrap(),
            b.group("@u3:x", "g1", &everyone()).unwrap(),
            b.vote("@u1:x", "p1", "A").unwrap(),
            b.vote("@u2:x", "p1", "B").unwrap(),
        ];
        let res = aggregate("p1", &store_with(&events), &TallyRules::default(), after_end()).unwrap();
        match res.tally {
            Tally::Counted { winners, .. } => assert_eq!(winners, vec!["A".to_string(), "B".to_string()]),
            Tally::Withheld => panic!("ended polls are counted"),
        }
    }

    #[test]
    fn no_votes_no_winner() {
        let mut b = EventBuilder::new(ROOM);
        let events = vec![b.poll("@u3:x", "p1", &poll_content(PollType::Open, ResultType::Visible)).unwrap()];
        let res = aggregate("p1", &store_with(&events), &TallyRules::default(), after_end()).unwrap();
        assert_eq!(res.eligible_voters, 0);
        assert_eq!(res.tally, Tally::Counted {
            answers: vec![
                AnswerTally { answer_id: "A".to_string(), label: "Pizza".to_string(), count: 0, voters: Some(vec![]) },
                AnswerTally { answer_id: "B".to_string(), label: "Salad".to_string(), count: 0, voters: Some(vec![]) },
            ],
            winners: vec![],
        });
    }

    #[test]
    fn ungrouped_polls() {
        let mut b = EventBuilder::new(ROOM);
        let events = vec![
            b.poll("@u3:x", "p1", &poll_content(PollType::Open, ResultType::Visible)).unwrap(),
            b.vote("@anyone:x", "p1", "B").unwrap(),
        ];
        let store = store_with(&events);
        let res = aggregate("p1", &store, &TallyRules::default(), after_end()).unwrap();
        assert_eq!(res.eligible_voters, 1);
        assert_eq!(res.counts(), counts(&[("A", 0), ("B", 1)]));

        let strict = TallyRules {
            ungrouped: UngroupedPolicy::NoVoters,
            ..TallyRules::default()
        };
        let res = aggregate("p1", &store, &strict, after_end()).unwrap();
        assert_eq!(res.cast_votes, 0);
        assert_eq!(res.eligibility.ineligible_votes, 1);
    }

    #[test]
    fn unknown_poll_has_no_result() {
        let mut b = EventBuilder::new(ROOM);
        let store = store_with(&[b.vote("@u1:x", "p9", "A").unwrap()]);
        assert_eq!(aggregate("p9", &store, &TallyRules::default(), after_end()), None);
    }
}

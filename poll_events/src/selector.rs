use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::debug;

use crate::aggregate::tally_poll;
use crate::config::*;
use crate::store::PollStore;

type PollKey = (String, String);

struct Memo {
    revision: u64,
    is_final: bool,
    result: PollResult,
}

#[derive(Default)]
struct Cache {
    memos: HashMap<PollKey, Memo>,
    // Polls seen final once. They stay final even if the poll is later
    // edited to end in the future.
    latched: HashSet<PollKey>,
}

/// Read side of the stores: computes poll results on demand.
///
/// Results are memoized per (room, poll) and recomputed only when the
/// revision of the poll in the store moves or when the poll becomes final.
/// The selector only reads the stores it is given and can be shared between
/// threads.
///
/// One selector serves at most one store per room: memos are keyed by room
/// id, so two stores of the same room (a clone replayed differently, say)
/// would read each other's results. Give each such store its own selector.
/// [`Rooms`](crate::Rooms) keeps one store per room and shares its selector.
pub struct ResultSelector {
    rules: TallyRules,
    cache: Mutex<Cache>,
}

impl ResultSelector {
    pub fn new(rules: &TallyRules) -> ResultSelector {
        ResultSelector {
            rules: rules.clone(),
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn rules(&self) -> &TallyRules {
        &self.rules
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        // The cache holds no invariant that a panic could break.
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The result of a poll at `now`, or `None` if the store does not know
    /// the poll.
    pub fn select(&self, store: &PollStore, poll_id: &str, now: DateTime<Utc>) -> Option<PollResult> {
        let poll = store.poll(poll_id)?;
        let key: PollKey = (store.room_id().to_string(), poll_id.to_string());
        let revision = store.poll_revision(poll_id);

        let mut cache = self.cache();
        let is_final = cache.latched.contains(&key) || poll.content.has_ended(now);
        if let Some(memo) = cache.memos.get(&key) {
            if memo.revision == revision && memo.is_final == is_final {
                return Some(memo.result.clone());
            }
        }

        debug!(
            "select: computing {} in {} at revision {}",
            poll_id,
            store.room_id(),
            revision
        );
        let result = tally_poll(poll_id, store, &self.rules, is_final)?;
        if is_final {
            cache.latched.insert(key.clone());
        }
        cache.memos.insert(
            key,
            Memo {
                revision,
                is_final,
                result: result.clone(),
            },
        );
        Some(result)
    }

    /// The results of all the polls of a store, in display order.
    pub fn select_all(&self, store: &PollStore, now: DateTime<Utc>) -> Vec<PollResult> {
        store
            .ordered_poll_ids()
            .iter()
            .filter_map(|poll_id| self.select(store, poll_id, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EventBuilder;
    use crate::ingest;

    const ROOM: &str = "!room:example.org";

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn timed_poll(result_type: ResultType, end: &str) -> PollContent {
        let mut poll = PollContent::new(
            "Budget",
            &[("yes", "Yes"), ("no", "No")],
            PollType::Open,
            result_type,
        );
        poll.start_time = Some(utc("2024-05-01T10:00:00Z"));
        poll.end_time = Some(utc(end));
        poll
    }

    #[test]
    fn late_poll_picks_up_waiting_votes() {
        let mut b = EventBuilder::new(ROOM);
        let selector = ResultSelector::new(&TallyRules::default());
        let now = utc("2024-05-01T10:30:00Z");
        let mut store = PollStore::new(ROOM);

        ingest(&mut store, &b.vote("@u1:x", "P9", "yes").unwrap()).unwrap();
        assert_eq!(selector.select(&store, "P9", now), None);

        let poll = timed_poll(ResultType::Visible, "2024-05-01T11:00:00Z");
        ingest(&mut store, &b.poll("@mod:x", "P9", &poll).unwrap()).unwrap();
        let res = selector.select(&store, "P9", now).unwrap();
        assert_eq!(res.cast_votes, 1);
        assert_eq!(
            res.counts(),
            Some(vec![("yes".to_string(), 1), ("no".to_string(), 0)])
        );
    }

    #[test]
    fn memo_follows_the_store() {
        let mut b = EventBuilder::new(ROOM);
        let selector = ResultSelector::new(&TallyRules::default());
        let now = utc("2024-05-01T10:30:00Z");
        let mut store = PollStore::new(ROOM);
        let poll = timed_poll(ResultType::Visible, "2024-05-01T11:00:00Z");
        ingest(&mut store, &b.poll("@mod:x", "p1", &poll).unwrap()).unwrap();

        let first = selector.select(&store, "p1", now).unwrap();
        assert_eq!(selector.select(&store, "p1", now), Some(first.clone()));
        assert_eq!(first.cast_votes, 0);

        ingest(&mut store, &b.vote("@u1:x", "p1", "no").unwrap()).unwrap();
        let second = selector.select(&store, "p1", now).unwrap();
        assert_eq!(second.cast_votes, 1);

        // A change elsewhere in the room keeps the memo.
        ingest(&mut store, &b.room_name("@mod:x", "Board").unwrap()).unwrap();
        assert_eq!(selector.select(&store, "p1", now), Some(second));
    }

    #[test]
    fn replayed_copy_uses_its_own_selector() {
        let mut b = EventBuilder::new(ROOM);
        let now = utc("2024-05-01T10:30:00Z");
        let mut store = PollStore::new(ROOM);
        let poll = timed_poll(ResultType::Visible, "2024-05-01T11:00:00Z");
        ingest(&mut store, &b.poll("@mod:x", "p1", &poll).unwrap()).unwrap();
        let mut copy = store.clone();
        ingest(&mut store, &b.vote("@u1:x", "p1", "yes").unwrap()).unwrap();
        ingest(&mut copy, &b.vote("@u1:x", "p1", "no").unwrap()).unwrap();
        assert_eq!(store.poll_revision("p1"), copy.poll_revision("p1"));

        let selector = ResultSelector::new(&TallyRules::default());
        let copy_selector = ResultSelector::new(&TallyRules::default());
        let res = selector.select(&store, "p1", now).unwrap();
        let copy_res = copy_selector.select(&copy, "p1", now).unwrap();
        assert_eq!(res.participation[0].answer_id.as_deref(), Some("yes"));
        assert_eq!(copy_res.participation[0].answer_id.as_deref(), Some("no"));
    }

    #[test]
    fn final_results_stay_visible() {
        let mut b = EventBuilder::new(ROOM);
        let selector = ResultSelector::new(&TallyRules::default());
        let mut store = PollStore::new(ROOM);
        let poll = timed_poll(ResultType::Hidden, "2024-05-01T11:00:00Z");
        ingest(&mut store, &b.poll("@mod:x", "p1", &poll).unwrap()).unwrap();
        ingest(&mut store, &b.vote("@u1:x", "p1", "yes").unwrap()).unwrap();

        let running = selector.select(&store, "p1", utc("2024-05-01T10:30:00Z")).unwrap();
        assert_eq!(running.tally, Tally::Withheld);
        let ended = selector.select(&store, "p1", utc("2024-05-01T11:00:00Z")).unwrap();
        assert!(ended.is_final);
        assert!(ended.counts().is_some());

        // Moving the end into the future does not hide the result again.
        let reopened = timed_poll(ResultType::Hidden, "2024-05-02T11:00:00Z");
        ingest(&mut store, &b.poll("@mod:x", "p1", &reopened).unwrap()).unwrap();
        let res = selector.select(&store, "p1", utc("2024-05-01T12:00:00Z")).unwrap();
        assert!(res.is_final);
        assert_eq!(
            res.counts(),
            Some(vec![("yes".to_string(), 1), ("no".to_string(), 0)])
        );
    }

    #[test]
    fn select_all_in_display_order() {
        let mut b = EventBuilder::new(ROOM);
        let selector = ResultSelector::new(&TallyRules::default());
        let now = utc("2024-05-01T10:30:00Z");
        let poll = timed_poll(ResultType::Visible, "2024-05-01T11:00:00Z");
        let mut store = PollStore::new(ROOM);
        for id in ["p2", "p1"] {
            ingest(&mut store, &b.poll("@mod:x", id, &poll).unwrap()).unwrap();
        }
        let group = GroupContent::new("G", &["p2"], &[("@mod:x", MemberRole::Moderator)]);
        ingest(&mut store, &b.group("@mod:x", "g1", &group).unwrap()).unwrap();

        let ids: Vec<String> = selector
            .select_all(&store, now)
            .into_iter()
            .map(|r| r.poll_id)
            .collect();
        assert_eq!(ids, vec!["p2", "p1"]);
    }
}

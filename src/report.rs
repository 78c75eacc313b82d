use log::{debug, info, warn};

use poll_events::*;
use snafu::{prelude::*, Snafu};

use std::collections::BTreeMap;
use std::fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::report::config_reader::*;
use crate::report::io_events::read_events;

mod io_events;

#[derive(Debug, Snafu)]
pub enum ReportError {
    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing the JSON file {path}"))]
    ParsingJson {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Error parsing the events in {path}"))]
    ParsingEvents {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Invalid value {value:?} for the configuration field {field}"))]
    InvalidConfig { field: String, value: String },
    #[snafu(display("Error serializing the report"))]
    SerializingReport { source: serde_json::Error },
    #[snafu(display("Error writing the report to {path}"))]
    WritingReport {
        source: std::io::Error,
        path: String,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type ReportResult<T> = Result<T, ReportError>;

pub mod config_reader {
    use crate::report::*;

    #[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct OutputSettings {
        pub report_name: Option<String>,
        pub output_path: Option<String>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RulesConfig {
        pub voting_roles: Option<Vec<String>>,
        pub ungrouped_polls: Option<String>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct ReportConfig {
        pub rules: RulesConfig,
        pub evaluated_at: Option<String>,
        pub output_settings: OutputSettings,
    }

    pub fn read_config(path: &str) -> ReportResult<ReportConfig> {
        let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
        let config: ReportConfig =
            serde_json::from_str(&contents).context(ParsingJsonSnafu { path })?;
        Ok(config)
    }

    pub fn read_reference(path: &str) -> ReportResult<JSValue> {
        let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
        debug!("read content: {:?}", contents);
        let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path })?;
        Ok(js)
    }

    pub fn validate_rules(rules: &RulesConfig) -> ReportResult<TallyRules> {
        let defaults = TallyRules::default();
        let voting_roles = match &rules.voting_roles {
            None => defaults.voting_roles,
            Some(names) => {
                let mut roles: Vec<MemberRole> = Vec::new();
                for name in names.iter() {
                    let role = MemberRole::parse(name).context(InvalidConfigSnafu {
                        field: "rules.votingRoles",
                        value: name.clone(),
                    })?;
                    roles.push(role);
                }
                roles
            }
        };
        let ungrouped = match rules.ungrouped_polls.as_deref() {
            None | Some("anyVoter") => UngroupedPolicy::AnyVoter,
            Some("noVoters") => UngroupedPolicy::NoVoters,
            Some(x) => {
                return InvalidConfigSnafu {
                    field: "rules.ungroupedPolls",
                    value: x,
                }
                .fail()
            }
        };
        Ok(TallyRules {
            voting_roles,
            ungrouped,
        })
    }

    /// The instant of the tally: the given RFC 3339 timestamp, or the current time.
    pub fn evaluation_time(timestamp: Option<&str>) -> ReportResult<DateTime<Utc>> {
        match timestamp {
            None => Ok(Utc::now()),
            Some(s) => {
                let t = DateTime::parse_from_rfc3339(s)
                    .ok()
                    .context(InvalidConfigSnafu {
                        field: "evaluatedAt",
                        value: s,
                    })?;
                Ok(t.with_timezone(&Utc))
            }
        }
    }
}

/// What to tally and where to write it. The paths are the ones given on the
/// command line.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct ReportRequest {
    pub input_path: String,
    pub config_path: Option<String>,
    pub out_path: Option<String>,
    pub reference_path: Option<String>,
    pub now: Option<String>,
    pub room: Option<String>,
}

// ******** Report structures *********

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollEntry {
    #[serde(flatten)]
    result: PollResult,
    export_allowed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnresolvedVote {
    poll_id: String,
    voter: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomReport {
    room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_name: Option<String>,
    polls: Vec<PollEntry>,
    unresolved_votes: Vec<UnresolvedVote>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct Diagnostics {
    events_read: usize,
    events_applied: usize,
    events_unchanged: usize,
    events_ignored: usize,
    ignored_reasons: BTreeMap<&'static str, usize>,
}

impl Diagnostics {
    fn ignore(&mut self, reason: &'static str) {
        self.events_ignored += 1;
        *self.ignored_reasons.entry(reason).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    report_name: Option<String>,
    evaluated_at: DateTime<Utc>,
    rooms: Vec<RoomReport>,
    diagnostics: Diagnostics,
}

fn ignore_reason(e: &EventError) -> &'static str {
    match e {
        EventError::MissingField { .. } => "missingField",
        EventError::InvalidField { .. } => "invalidField",
        EventError::InvalidEnumValue { .. } => "invalidEnumValue",
        EventError::DuplicateAnswerId { .. } => "duplicateAnswerId",
        EventError::UnsupportedVersion { .. } => "unsupportedVersion",
        EventError::UnknownEventType { .. } => "unknownEventType",
        EventError::Canonicalize { .. } => "canonicalize",
    }
}

fn room_report(rooms: &Rooms, store: &PollStore, now: DateTime<Utc>) -> RoomReport {
    let polls: Vec<PollEntry> = rooms
        .results(store.room_id(), now)
        .into_iter()
        .map(|result| {
            let export_allowed = store.export_allowed(result.group_id.as_deref(), now);
            PollEntry {
                result,
                export_allowed,
            }
        })
        .collect();
    RoomReport {
        room_id: store.room_id().to_string(),
        room_name: store.room_name().map(|s| s.to_string()),
        polls,
        unresolved_votes: store
            .unresolved_votes()
            .into_iter()
            .map(|(poll_id, voter)| UnresolvedVote { poll_id, voter })
            .collect(),
    }
}

fn write_report(path: Option<&str>, pretty_js: &str) -> ReportResult<()> {
    match path {
        None | Some("stdout") => {
            println!("{}", pretty_js);
        }
        Some(p) => {
            info!("Writing report to {}", p);
            fs::write(p, pretty_js).context(WritingReportSnafu { path: p })?;
        }
    }
    Ok(())
}

pub fn run_report(request: &ReportRequest) -> ReportResult<()> {
    let config = match &request.config_path {
        Some(p) => read_config(p)?,
        None => ReportConfig::default(),
    };
    info!("config: {:?}", config);
    let rules = validate_rules(&config.rules)?;
    let now = evaluation_time(
        request
            .now
            .as_deref()
            .or(config.evaluated_at.as_deref()),
    )?;

    let event_file = read_events(&request.input_path)?;
    let mut diagnostics = Diagnostics {
        events_read: event_file.total,
        ..Diagnostics::default()
    };
    for _ in 0..event_file.malformed {
        diagnostics.ignore("malformedEnvelope");
    }

    let mut rooms = Rooms::new(&rules);
    for raw in event_file.events.iter() {
        match rooms.ingest(raw) {
            Ok(applied) if applied.changed => diagnostics.events_applied += 1,
            Ok(_) => diagnostics.events_unchanged += 1,
            Err(e) => diagnostics.ignore(ignore_reason(&e)),
        }
    }
    info!(
        "Ingested {} events: {} applied, {} unchanged, {} ignored",
        diagnostics.events_read,
        diagnostics.events_applied,
        diagnostics.events_unchanged,
        diagnostics.events_ignored
    );

    let room_reports: Vec<RoomReport> = rooms
        .stores()
        .filter(|store| {
            request
                .room
                .as_deref()
                .map_or(true, |room_id| store.room_id() == room_id)
        })
        .map(|store| room_report(&rooms, store, now))
        .collect();
    if room_reports.is_empty() {
        warn!("No room to report");
    }

    let report = Report {
        report_name: config.output_settings.report_name.clone(),
        evaluated_at: now,
        rooms: room_reports,
        diagnostics,
    };
    // Going through a JSON value sorts the keys like the reference is sorted.
    let report_js = serde_json::to_value(&report).context(SerializingReportSnafu {})?;
    let pretty_js_report =
        serde_json::to_string_pretty(&report_js).context(SerializingReportSnafu {})?;
    let out_path = request
        .out_path
        .as_deref()
        .or(config.output_settings.output_path.as_deref());
    write_report(out_path, &pretty_js_report)?;

    // The reference report, if provided for comparison
    if let Some(reference_path) = &request.reference_path {
        let reference = read_reference(reference_path)?;
        let pretty_js_reference =
            serde_json::to_string_pretty(&reference).context(SerializingReportSnafu {})?;
        if pretty_js_reference != pretty_js_report {
            warn!("Found differences with the reference report");
            print_diff(
                pretty_js_reference.as_str(),
                pretty_js_report.as_ref(),
                "\n",
            );
            whatever!("Difference detected between computed report and reference report")
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::config_reader::*;
    use super::*;
    use snafu::ErrorCompat;

    fn run_report_test(test_name: &str, events_lpath: &str) {
        let test_dir = format!("{}/testdata", env!("CARGO_MANIFEST_DIR"));
        info!("Running test {}", test_name);
        let request = ReportRequest {
            input_path: format!("{}/{}/{}", test_dir, test_name, events_lpath),
            config_path: Some(format!("{}/{}/config.json", test_dir, test_name)),
            reference_path: Some(format!("{}/{}/expected_report.json", test_dir, test_name)),
            ..ReportRequest::default()
        };
        let res = run_report(&request);
        if let Err(e) = res {
            warn!("Error occured {:?}", e);
            eprintln!("An error occured {}", e);
            if let Some(bt) = ErrorCompat::backtrace(&e) {
                eprintln!("trace: {}", bt);
            } else {
                eprintln!("No trace found");
            }
            panic!("test {} failed", test_name);
        }
    }

    fn test_wrapper(test_name: &str, events_lpath: &str) {
        run_report_test(test_name, events_lpath)
    }

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn board_meeting() {
        init();
        test_wrapper("board_meeting", "events.json");
    }

    #[test]
    fn strict_rules_jsonl() {
        init();
        test_wrapper("strict_rules_jsonl", "events.jsonl");
    }

    #[test]
    fn default_rules() {
        let rules = validate_rules(&RulesConfig::default()).unwrap();
        assert_eq!(rules, TallyRules::default());
    }

    #[test]
    fn rules_from_config() {
        let config: ReportConfig = serde_json::from_str(
            r#"{"rules": {"votingRoles": ["moderator", "observer"], "ungroupedPolls": "noVoters"}}"#,
        )
        .unwrap();
        let rules = validate_rules(&config.rules).unwrap();
        assert_eq!(
            rules.voting_roles,
            vec![MemberRole::Moderator, MemberRole::Observer]
        );
        assert_eq!(rules.ungrouped, UngroupedPolicy::NoVoters);
        assert_eq!(config.output_settings, OutputSettings::default());
    }

    #[test]
    fn unknown_config_values() {
        let bad_role = RulesConfig {
            voting_roles: Some(vec!["admin".to_string()]),
            ungrouped_polls: None,
        };
        assert!(matches!(
            validate_rules(&bad_role),
            Err(ReportError::InvalidConfig { value, .. }) if value == "admin"
        ));
        let bad_policy = RulesConfig {
            voting_roles: None,
            ungrouped_polls: Some("everyone".to_string()),
        };
        assert!(matches!(
            validate_rules(&bad_policy),
            Err(ReportError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn evaluation_times() {
        let t = evaluation_time(Some("2024-05-01T12:00:00+02:00")).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(matches!(
            evaluation_time(Some("yesterday")),
            Err(ReportError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn missing_input() {
        let request = ReportRequest {
            input_path: "does/not/exist.json".to_string(),
            ..ReportRequest::default()
        };
        assert!(matches!(
            run_report(&request),
            Err(ReportError::OpeningJson { .. })
        ));
    }
}

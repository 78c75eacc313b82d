// Primitives for reading files of room events.

use crate::report::*;

/// The events of one input file, in file order.
#[derive(Debug, Clone)]
pub struct EventFile {
    pub events: Vec<RawEvent>,
    /// JSON values that do not look like a room event at all.
    pub malformed: usize,
    /// Number of entries in the file, malformed ones included.
    pub total: usize,
}

pub fn read_events(path: &str) -> ReportResult<EventFile> {
    info!("Attempting to read event file {:?}", path);
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    parse_events(path, &contents)
}

/// Accepts either a JSON array of events or one JSON event per line.
/// Text that is not JSON fails the whole file.
pub fn parse_events(path: &str, contents: &str) -> ReportResult<EventFile> {
    let values: Vec<JSValue> = if contents.trim_start().starts_with('[') {
        serde_json::from_str(contents).context(ParsingEventsSnafu { path })?
    } else {
        let mut values: Vec<JSValue> = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            values.push(serde_json::from_str(line).context(ParsingEventsSnafu { path })?);
        }
        values
    };

    let total = values.len();
    let mut events: Vec<RawEvent> = Vec::new();
    for (idx, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<RawEvent>(value) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!("read_events: {}: skipping malformed event #{}: {}", path, idx, e);
            }
        }
    }
    debug!("read_events: {} events in {}", events.len(), path);
    Ok(EventFile {
        malformed: total - events.len(),
        events,
        total,
    })
}

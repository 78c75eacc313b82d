use clap::Parser;

/// This is a tallying program for collaborative poll events.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The file containing the room events, either as a JSON array or with one JSON
    /// event per line.
    #[clap(short, long, value_parser)]
    pub input: String,

    /// (file path, optional) The configuration of the tally in JSON format.
    /// For more information about the file format, read the documentation of poll_events::manual.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,

    /// (file path) A reference report in JSON format. If provided, polltally will
    /// check that the computed report matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (file path, 'stdout' or empty) If specified, the report will be written in JSON format to the given
    /// location. Setting this option overrides the path that may be specified with the --config option.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// (RFC 3339 timestamp or empty) The instant at which the results are computed. Overrides
    /// the evaluatedAt field of the configuration. Defaults to the current time.
    #[clap(long, value_parser)]
    pub now: Option<String>,

    /// (room id or empty) If specified, only this room is reported.
    #[clap(long, value_parser)]
    pub room: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}

mod args;
mod report;

use clap::Parser;
use log::{info, LevelFilter};
use snafu::ErrorCompat;

use crate::args::Args;
use crate::report::ReportRequest;

fn main() {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();
    info!("args: {:?}", args);

    let request = ReportRequest {
        input_path: args.input,
        config_path: args.config,
        out_path: args.out,
        reference_path: args.reference,
        now: args.now,
        room: args.room,
    };
    if let Err(e) = report::run_report(&request) {
        eprintln!("An error occured: {}", e);
        if let Some(bt) = ErrorCompat::backtrace(&e) {
            eprintln!("trace: {}", bt);
        }
        std::process::exit(1);
    }
}

mod receive;

use clap::{Arg, Command};
use slog::{o, Drain};
use std::io;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cmd_app = Command::new("rtp capture tool")
        .version(clap::crate_version!())
        .author("Matthias Behr <mbehr+adlt@mcbehr.de>")
        .about("Tool to receive live RTP streams via UDP/TCP and capture them to a file.")
        .arg(
            Arg::new("verbose")
                .global(true)
                .short('v')
                .action(clap::ArgAction::Count)
                .help("verbosity level"),
        );
    let cmd_app = receive::add_subcommand(cmd_app);
    let matches = cmd_app.get_matches();

    // by default we do output: Critical, Error, Warning
    // -v +Info -vv +Debug -vvv +Trace
    // Debug is removed at build time in Release builds by default!
    let min_log_level = match matches.get_count("verbose") {
        0 => slog::Level::Warning,
        1 => slog::Level::Info,
        2 => slog::Level::Debug,
        _ => slog::Level::Trace,
    };
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .build()
        .filter_level(min_log_level)
        .fuse();
    let log = slog::Logger::root(
        drain,
        o!("version"=>clap::crate_version!(), "log_level"=>format!("{}",min_log_level)),
    );

    match matches.subcommand() {
        Some(("receive", sub_m)) => {
            receive::receive(&log, sub_m, std::io::BufWriter::new(std::io::stdout()), None)
                .map(|_nr_packets| ())
        }
        _ => Err(Box::new(io::Error::new(
            io::ErrorKind::Unsupported,
            "unknown subcommand",
        ))),
    }
}

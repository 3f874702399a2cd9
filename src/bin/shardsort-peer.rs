use std::path;
use std::process;

use clap::ArgEnum;
use env_logger;
use log;

use shardsort::{dist, Roster};

#[tokio::main]
async fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let peer_id: u32 = arg_parser.value_of_t_or_exit("peer_id");
    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let roster_path = arg_parser.value_of("roster").expect("value is required");

    // the roster is validated before any network activity
    let roster = match Roster::load(path::Path::new(roster_path)) {
        Ok(roster) => roster,
        Err(err) => {
            log::error!("roster loading error: {}", err);
            process::exit(1);
        }
    };

    if roster.get(peer_id).is_none() {
        log::error!("peer id {} is not part of the roster", peer_id);
        process::exit(1);
    }

    log::info!(
        "peer {} of {}: sorting {} into {}",
        peer_id,
        roster.len(),
        input,
        output
    );
    if let Err(err) = dist::sort_shard(
        peer_id,
        path::Path::new(input),
        path::Path::new(output),
        &roster,
    )
    .await
    {
        log::error!("distributed sorting error: {}", err);
        process::exit(1);
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("shardsort-peer")
        .about("one peer of the distributed partitioned record sort")
        .arg(
            clap::Arg::new("peer_id")
                .help("id of this peer in the roster")
                .required(true)
                .takes_value(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("peer id must be an integer: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("input")
                .help("this peer's shard of the input")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .help("result file for this peer's key range")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("roster")
                .help("YAML roster listing every peer")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}

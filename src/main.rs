use std::path::PathBuf;

use clap::{Arg, Command};
use tracing_subscriber::{fmt, EnvFilter};

use dd_home_worker::config::{self, ConfigError};
use dd_home_worker::supervisor;

fn cli() -> Command {
    Command::new("dd-home-worker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Worker agent for the DD@Home crowdsourced data collection cluster")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_name("PATH")
                .help("path to config.ini (defaults to the directory next to the executable)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .value_name("LEVEL")
                .help("log level (error, warn, info, debug, trace); overridden by RUST_LOG")
                .default_value("info"),
        )
        .subcommand(Command::new("run").about("connect to the coordinator and start relaying (default)"))
        .subcommand(Command::new("config-path").about("print the config.ini path that would be used and exit"))
}

fn init_logger(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_timer(fmt::time::ChronoLocal::new("%H:%M:%S".to_string()))
        .with_target(true)
        .with_span_events(fmt::format::FmtSpan::NONE)
        .with_writer(std::io::stdout)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");

    if let Some(("config-path", _)) = matches.subcommand() {
        let path = config_path.unwrap_or_else(config::default_config_path);
        println!("{}", path.display());
        return;
    }

    init_logger(log_level);

    let config = match config::load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(ConfigError::JustCreated) => {
            // load_config already logged where the file landed; nothing
            // left to run until the operator edits it.
            return;
        }
        Err(e) => {
            tracing::error!("failed to load config.ini: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor::run(config).await {
        tracing::error!("worker exited with error: {}", e);
        std::process::exit(1);
    }
}

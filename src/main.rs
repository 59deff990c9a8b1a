// src/main.rs
mod backlog;
mod client_pool;
mod config;
mod conn_pool;
mod dispatch;
mod frame;
mod framing;
mod listener;
mod message;
mod reassembler;
mod receiver;
mod replay;
mod ship;
mod sniffer;
mod statsd;
mod stats;
mod util;

use clap::Parser;
use config::{Cli, Command, ListenSettings, ReplaySettings};
use log::info;
use statsd::Statsd;
use util::ShutdownFlag;

fn main() -> anyhow::Result<()> {
    // Only the two modes (and help/version) go through the flag parser;
    // anything else is a usage hint, not an error.
    match std::env::args().nth(1).as_deref() {
        Some("listen" | "replay" | "-h" | "--help" | "-V" | "--version") => {}
        _ => {
            println!("Usage:\n\tretap listen -h\n\tretap replay -h");
            return Ok(());
        }
    }

    match Cli::parse().command {
        Command::Listen(args) => {
            let settings = ListenSettings::from_args(args)?;
            init_logger(settings.verbose);
            info!("retap {}", env!("CARGO_PKG_VERSION"));
            let statsd = build_statsd(
                settings.statsd.as_deref(),
                settings.statsd_prefix.as_deref(),
                "listen",
            )?;
            listener::run(settings, statsd, install_signal_handler()?)
        }
        Command::Replay(args) => {
            let settings = ReplaySettings::from_args(args)?;
            init_logger(settings.verbose);
            info!("retap {}", env!("CARGO_PKG_VERSION"));
            let statsd = build_statsd(
                settings.statsd.as_deref(),
                settings.statsd_prefix.as_deref(),
                "replay",
            )?;
            replay::run(settings, statsd, install_signal_handler()?)
        }
    }
}

fn init_logger(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// SIGINT/SIGTERM raise the flag; every long-lived loop polls it.
fn install_signal_handler() -> anyhow::Result<ShutdownFlag> {
    let shutdown = ShutdownFlag::default();
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.raise())?;
    Ok(shutdown)
}

fn build_statsd(
    address: Option<&str>,
    user_prefix: Option<&str>,
    mode: &str,
) -> anyhow::Result<Statsd> {
    match address {
        Some(addr) => Statsd::new(addr, statsd::make_prefix(mode, user_prefix)),
        None => Ok(Statsd::disabled()),
    }
}

// src/replay.rs
use crate::backlog::Backlog;
use crate::config::ReplaySettings;
use crate::dispatch;
use crate::receiver;
use crate::statsd::Statsd;
use crate::util::ShutdownFlag;
use log::{info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// The `replay` subcommand: accept mirrored requests (socket or file) and
/// drive the worker pool until a signal.
pub fn run(settings: ReplaySettings, statsd: Statsd, shutdown: ShutdownFlag) -> anyhow::Result<()> {
    let hosts = Arc::new(settings.forwarded_hosts()?);
    for host in hosts.iter() {
        info!("forwarding requests to {} (limit {})", host.url, host.limit);
    }
    if hosts.len() > 1 {
        warn!(
            "{} forward targets configured, but only the first ({}) is dispatched to; \
             the others will receive no traffic",
            hosts.len(),
            hosts[0].url
        );
    }

    let (backlog, backlog_rx) = Backlog::new(settings.backlog_size);
    let workers = dispatch::spawn_workers(
        backlog_rx,
        hosts.clone(),
        settings.worker_count(),
        settings.timeout,
        statsd.clone(),
        shutdown.clone(),
    );
    let telemetry = dispatch::spawn_backlog_telemetry(backlog.clone(), statsd, shutdown.clone());

    match &settings.replay_file {
        Some(path) => {
            receiver::run_file(path, &backlog)?;
            // File consumed; workers keep draining until the signal.
        }
        None => {
            receiver::spawn_listener(&settings.address, settings.persistent_connections, backlog)?;
        }
    }

    while !shutdown.is_raised() {
        thread::sleep(Duration::from_millis(100));
    }
    for worker in workers {
        worker.join().ok();
    }
    telemetry.join().ok();

    for host in hosts.iter() {
        let snap = host.stats.snapshot();
        info!(
            "{}: {} responses, mean elapsed {:?}, codes {:?}",
            host.url, snap.responses, snap.mean_elapsed, snap.codes
        );
    }
    Ok(())
}

// src/listener.rs
use crate::config::ListenSettings;
use crate::reassembler::{self, Reassembler};
use crate::ship::{Shipper, ShipperConfig};
use crate::sniffer;
use crate::statsd::Statsd;
use crate::util::ShutdownFlag;
use crossbeam_channel::bounded;
use log::info;
use std::thread;

/// Decoded frames waiting for reassembly. Small on purpose: once this
/// fills, captured packets queue in the kernel and drop there.
const FRAME_QUEUE_SIZE: usize = 100;

/// Completed requests waiting to be shipped.
const MSG_QUEUE_SIZE: usize = 5000;

/// The `listen` subcommand: capture, reassemble, ship, until a signal.
pub fn run(settings: ListenSettings, statsd: Statsd, shutdown: ShutdownFlag) -> anyhow::Result<()> {
    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("the listener must run as root: sniffing needs raw capture privileges");
    }

    // Fail fast on everything fallible before any thread starts.
    let capture = sniffer::open_capture(&settings.interface, &settings.pcap_filter)?;
    let shipper = Shipper::new(ShipperConfig {
        replay_address: settings.replay_address.clone(),
        replay_limit: settings.replay_limit,
        pool_size: settings.pool_size,
        dgram: settings.dgram,
        record_file: settings.record_file.clone(),
        noreplay: settings.noreplay,
        multiply: settings.multiply,
        die_on_send_error: settings.die_if_replay_server_is_unreachable,
        verbose: settings.verbose,
    })?;

    info!(
        "listening for HTTP traffic on {} with filter {:?}",
        settings.interface, settings.pcap_filter
    );
    info!(
        "forwarding requests to replay server {} (limit {})",
        settings.replay_address, settings.replay_limit
    );

    let (frame_tx, frame_rx) = bounded(FRAME_QUEUE_SIZE);
    let (msg_tx, msg_rx) = bounded(MSG_QUEUE_SIZE);

    let sniffer_thread = {
        let shutdown = shutdown.clone();
        let packet_limit = settings.packet_limit;
        thread::Builder::new()
            .name("sniffer".into())
            .spawn(move || sniffer::run(capture, packet_limit, frame_tx, shutdown))?
    };

    let reassembler_thread = {
        let shutdown = shutdown.clone();
        let reasm = Reassembler::new(settings.port, settings.no_reasm, msg_tx);
        thread::Builder::new()
            .name("reassembler".into())
            .spawn(move || reassembler::run(frame_rx, reasm, shutdown))?
    };

    let shipper_thread = {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("shipper".into())
            .spawn(move || shipper.run(msg_rx, statsd, shutdown))?
    };

    // Shutdown cascades: the sniffer exits on the raised flag, its channel
    // disconnect unwinds the reassembler, then the shipper.
    sniffer_thread.join().ok();
    reassembler_thread.join().ok();
    shipper_thread.join().ok();
    Ok(())
}

// src/sniffer.rs
use crate::frame::{self, Frame};
use crate::util::ShutdownFlag;
use crossbeam_channel::Sender;
use log::{debug, error, info};
use pcap::{Active, Capture};
use std::time::{Duration, Instant};

/// Frames shorter than an Ethernet + IPv4 + TCP header cannot be a request
/// segment; skip them before decoding.
const MIN_PACKET_LEN: usize = 34;

const SNAPLEN: i32 = 4096;
/// Read timeout so the capture loop can observe shutdown.
const READ_TIMEOUT_MS: i32 = 100;

/// Open the capture handle: promiscuous, filtered. Fails fast on an
/// unknown interface or missing privileges.
pub fn open_capture(device: &str, filter: &str) -> anyhow::Result<Capture<Active>> {
    let mut cap = Capture::from_device(device)
        .map_err(|e| anyhow::anyhow!("capture device {device}: {e}"))?
        .promisc(true)
        .snaplen(SNAPLEN)
        .timeout(READ_TIMEOUT_MS)
        .open()
        .map_err(|e| anyhow::anyhow!("opening capture on {device}: {e}"))?;
    cap.filter(filter, true)
        .map_err(|e| anyhow::anyhow!("applying filter {filter:?}: {e}"))?;
    Ok(cap)
}

/// Capture loop: read raw packets, enforce the per-second packet cap,
/// decode, and push frames downstream. The frames channel is small; a full
/// channel backpressures this loop and lets the kernel do the dropping.
pub fn run(mut cap: Capture<Active>, packet_limit: u64, tx: Sender<Frame>, shutdown: ShutdownFlag) {
    let mut bucket_start = Instant::now();
    let mut bucket_count: u64 = 0;

    while !shutdown.is_raised() {
        let packet = match cap.next_packet() {
            Ok(p) => p,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                error!("capture read failed: {e}");
                break;
            }
        };

        if packet.data.len() < MIN_PACKET_LEN {
            continue;
        }

        if packet_limit != 0 {
            if bucket_start.elapsed() > Duration::from_secs(1) {
                info!("packet rate: {bucket_count}/s");
                bucket_start = Instant::now();
                bucket_count = 0;
            }
            if bucket_count >= packet_limit {
                continue;
            }
            bucket_count += 1;
        }

        let Some(decoded) = frame::decode(packet.data) else {
            debug!("undecodable packet ({} bytes) dropped", packet.data.len());
            continue;
        };

        if tx.send(decoded).is_err() {
            // Reassembler is gone; nothing left to feed.
            break;
        }
    }
}

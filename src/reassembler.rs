// src/reassembler.rs
use crate::frame::{Frame, JoinKey};
use crate::message::{Message, IDLE_EXPIRE};
use crate::util::ShutdownFlag;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use log::debug;
use std::time::{Duration, Instant};

/// The shortest payload worth sniffing for a request line ("GET / HTTP/1.0").
const MIN_REQUEST_LEN: usize = 14;

/// Groups captured TCP segments into complete request payloads. There is no
/// protocol-level end marker: a message is done when its flow has been
/// silent for [`IDLE_EXPIRE`]. All state lives in one table owned by one
/// thread; frames and deadline sweeps interleave in that thread, so a
/// segment either extends a deadline or misses the already-emitted message,
/// never both.
pub struct Reassembler {
    table: HashMap<JoinKey, Message>,
    port: u16,
    no_reasm: bool,
    out: Sender<Bytes>,
}

impl Reassembler {
    pub fn new(port: u16, no_reasm: bool, out: Sender<Bytes>) -> Self {
        Self { table: HashMap::new(), port, no_reasm, out }
    }

    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Earliest deadline across in-flight messages, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.table.values().map(Message::deadline).min()
    }

    /// Route one captured frame. Only PSH segments addressed to the capture
    /// port are eligible; the BPF filter normally guarantees this, but the
    /// filter is user-overridable.
    pub fn handle_frame(&mut self, frame: Frame, now: Instant) {
        if frame.flow.dst_port != self.port || !frame.psh || frame.payload.is_empty() {
            return;
        }

        if self.no_reasm {
            self.fast_path(frame);
            return;
        }

        let key = frame.join_key();
        let message = self
            .table
            .entry(key)
            .or_insert_with(|| Message::new(key, now));
        if !message.add_segment(frame.seq, frame.payload, now) {
            debug!("duplicate segment seq={} dropped", frame.seq);
        }
    }

    /// `--no-reasm`: a payload that starts like a request is emitted on the
    /// spot, one segment per message, no per-flow state. Fast and wrong for
    /// anything that fragments.
    fn fast_path(&mut self, frame: Frame) {
        if frame.payload.len() < MIN_REQUEST_LEN {
            return;
        }
        if &frame.payload[..4] == b"GET " || &frame.payload[..4] == b"POST" {
            let _ = self.out.send(frame.payload);
        }
    }

    /// Emit every message whose deadline has passed. The send blocks when
    /// the completed-message queue is full, which backpressures the frames
    /// channel and ultimately the kernel.
    pub fn sweep(&mut self, now: Instant) {
        if self.table.is_empty() {
            return;
        }
        let expired: Vec<JoinKey> = self
            .table
            .iter()
            .filter(|(_, m)| m.expired(now))
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            let message = self.table.remove(&key).unwrap();
            debug!(
                "message ack={} complete: {} segment(s)",
                message.key.1,
                message.segment_count()
            );
            if self.out.send(message.into_payload()).is_err() {
                return;
            }
        }
    }
}

/// The reassembly thread: frames in, completed request payloads out.
pub fn run(rx: Receiver<Frame>, mut reasm: Reassembler, shutdown: ShutdownFlag) {
    while !shutdown.is_raised() {
        let wait = reasm
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_EXPIRE)
            .min(Duration::from_secs(1));

        match rx.recv_timeout(wait) {
            Ok(frame) => reasm.handle_frame(frame, Instant::now()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        reasm.sweep(Instant::now());
    }
    if reasm.in_flight() > 0 {
        debug!("exiting with {} in-flight message(s) unemitted", reasm.in_flight());
    }
}

// src/message.rs
use crate::frame::JoinKey;
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};

/// A message is declared terminal after this much silence.
pub const IDLE_EXPIRE: Duration = Duration::from_millis(200);

/// A message that never goes quiet (dribbled body, endless retransmits) is
/// emitted partial once it has lived this long.
pub const MAX_LIFETIME: Duration = Duration::from_secs(2);

/// One partially assembled request: the segments of a single client write,
/// all sharing one acknowledgement number on one flow.
#[derive(Debug)]
pub struct Message {
    pub key: JoinKey,
    segments: Vec<(u32, Bytes)>,
    idle_deadline: Instant,
    hard_deadline: Instant,
}

impl Message {
    pub fn new(key: JoinKey, now: Instant) -> Self {
        Self {
            key,
            segments: Vec::with_capacity(2),
            idle_deadline: now + IDLE_EXPIRE,
            hard_deadline: now + MAX_LIFETIME,
        }
    }

    /// Add a segment, refusing duplicates (first copy wins). An accepted
    /// segment resets the idle deadline; the hard deadline never moves.
    pub fn add_segment(&mut self, seq: u32, payload: Bytes, now: Instant) -> bool {
        if self.segments.iter().any(|(s, _)| *s == seq) {
            return false;
        }
        self.segments.push((seq, payload));
        self.idle_deadline = now + IDLE_EXPIRE;
        true
    }

    /// The instant at which this message should be emitted if nothing else
    /// arrives.
    pub fn deadline(&self) -> Instant {
        self.idle_deadline.min(self.hard_deadline)
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Concatenate segment payloads in ascending sequence order.
    pub fn into_payload(mut self) -> Bytes {
        if self.segments.len() == 1 {
            return self.segments.pop().unwrap().1;
        }
        self.segments.sort_unstable_by_key(|(seq, _)| *seq);
        let total: usize = self.segments.iter().map(|(_, p)| p.len()).sum();
        let mut out = BytesMut::with_capacity(total);
        for (_, p) in &self.segments {
            out.extend_from_slice(p);
        }
        out.freeze()
    }
}

// src/backlog.rs
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Soft headroom kept below the hard channel capacity.
const HIGH_WATER_MARGIN: usize = 100;

/// The bounded queue between the receiver and the workers. Producers never
/// block: above the high-water mark the frame is dropped and counted, so an
/// overloaded replay sheds tail load instead of stalling the listener path.
#[derive(Clone)]
pub struct Backlog {
    tx: Sender<Bytes>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl Backlog {
    pub fn new(capacity: usize) -> (Self, Receiver<Bytes>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                capacity,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn add(&self, frame: Bytes) {
        let high_water = self.capacity.saturating_sub(HIGH_WATER_MARGIN);
        if self.tx.len() > high_water {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.tx.try_send(frame).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn depth(&self) -> usize {
        self.tx.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// src/stats.rs
use crate::client_pool::ClientPool;
use hashbrown::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A replay target plus its live counters and optional keep-alive clients.
pub struct ForwardHost {
    pub url: String,
    /// Requests per second; 0 means unlimited.
    pub limit: u64,
    pub stats: HostStats,
    pub clients: Option<ClientPool>,
}

#[derive(Debug, Default)]
struct StatsInner {
    second_epoch: u64,
    count: u64,
    codes: HashMap<u16, u64>,
    responses: u64,
    elapsed: Duration,
}

/// Per-host request accounting. Workers hit this from many threads; one
/// mutex keeps the touch/check/increment sequence atomic per host.
#[derive(Debug, Default)]
pub struct HostStats(Mutex<StatsInner>);

impl HostStats {
    /// Roll the second bucket if the wall clock moved, then admit or reject
    /// one request against `limit`. Admission increments the bucket count.
    pub fn admit(&self, limit: u64, now_epoch: u64) -> bool {
        let mut inner = self.0.lock().unwrap();
        if inner.second_epoch != now_epoch {
            inner.second_epoch = now_epoch;
            inner.count = 0;
        }
        if limit != 0 && inner.count >= limit {
            return false;
        }
        inner.count += 1;
        true
    }

    pub fn record_response(&self, status: u16, elapsed: Duration) {
        let mut inner = self.0.lock().unwrap();
        *inner.codes.entry(status).or_insert(0) += 1;
        inner.responses += 1;
        inner.elapsed += elapsed;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.0.lock().unwrap();
        let mean_elapsed = if inner.responses == 0 {
            Duration::ZERO
        } else {
            inner.elapsed / inner.responses as u32
        };
        let mut codes: Vec<(u16, u64)> = inner.codes.iter().map(|(c, n)| (*c, *n)).collect();
        codes.sort_unstable();
        StatsSnapshot { responses: inner.responses, mean_elapsed, codes }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub responses: u64,
    pub mean_elapsed: Duration,
    /// Response-code histogram, sorted by code.
    pub codes: Vec<(u16, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_caps_one_second_bucket() {
        let stats = HostStats::default();
        let admitted = (0..10).filter(|_| stats.admit(3, 100)).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn bucket_resets_at_second_boundary() {
        let stats = HostStats::default();
        for _ in 0..3 {
            assert!(stats.admit(3, 100));
        }
        assert!(!stats.admit(3, 100));
        // Next wall-clock second: the count starts over.
        for _ in 0..3 {
            assert!(stats.admit(3, 101));
        }
        assert!(!stats.admit(3, 101));
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let stats = HostStats::default();
        assert!((0..10_000).all(|_| stats.admit(0, 100)));
    }

    #[test]
    fn responses_accumulate_codes_and_elapsed() {
        let stats = HostStats::default();
        stats.record_response(200, Duration::from_millis(10));
        stats.record_response(200, Duration::from_millis(30));
        stats.record_response(502, Duration::from_millis(2));
        let snap = stats.snapshot();
        assert_eq!(snap.responses, 3);
        assert_eq!(snap.mean_elapsed, Duration::from_millis(14));
        assert_eq!(snap.codes, vec![(200, 2), (502, 1)]);
    }
}

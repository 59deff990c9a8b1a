// src/ship.rs
use crate::conn_pool::{connect_stream, ConnectionPool};
use crate::framing;
use crate::statsd::Statsd;
use crate::util::{epoch_secs, ShutdownFlag};
use anyhow::Context;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

pub struct ShipperConfig {
    pub replay_address: String,
    /// Messages per second shipped to the replay process; 0 = unlimited.
    pub replay_limit: u64,
    pub pool_size: usize,
    pub dgram: bool,
    pub record_file: Option<PathBuf>,
    pub noreplay: bool,
    /// Ship each message this many times.
    pub multiply: usize,
    pub die_on_send_error: bool,
    pub verbose: bool,
}

/// Takes completed request payloads and emits each to the replay process,
/// optionally appending every message to a record file first.
pub struct Shipper {
    cfg: ShipperConfig,
    pool: Option<ConnectionPool>,
    record: Option<File>,
}

impl Shipper {
    /// Fails fast on an uncreatable record file; socket trouble is a
    /// runtime concern, not a setup one.
    pub fn new(cfg: ShipperConfig) -> anyhow::Result<Self> {
        let record = match &cfg.record_file {
            Some(path) => Some(
                File::create(path)
                    .with_context(|| format!("creating record file {}", path.display()))?,
            ),
            None => None,
        };
        let pool = (cfg.pool_size > 0).then(|| {
            ConnectionPool::new(cfg.replay_address.clone(), cfg.pool_size, cfg.dgram)
        });
        Ok(Self { cfg, pool, record })
    }

    /// The shipper thread: drain the completed-message queue until the
    /// upstream stages disconnect or shutdown is raised.
    pub fn run(mut self, rx: Receiver<Bytes>, statsd: Statsd, shutdown: ShutdownFlag) {
        if let Some(pool) = &self.pool {
            info!("shipping over a persistent pool of {} connection(s)", pool.size());
        }
        let mut bucket_epoch = epoch_secs();
        let mut bucket_count: u64 = 0;

        while !shutdown.is_raised() {
            let message = match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(m) => m,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let now = epoch_secs();
            if now != bucket_epoch {
                let unread = rx.len() as u64;
                info!("output: {bucket_count}/s, unread {unread}");
                statsd.inc("output", bucket_count);
                statsd.inc("unread", unread);
                bucket_epoch = now;
                bucket_count = 0;
            }
            if self.cfg.replay_limit != 0 && bucket_count >= self.cfg.replay_limit {
                continue;
            }
            bucket_count += 1;

            if let Some(record) = &mut self.record {
                if let Err(e) = framing::write_frame(record, &message) {
                    error!("record file write failed: {e}");
                }
            }

            if self.cfg.verbose {
                info!("{}", request_line(&message));
            }

            if self.cfg.noreplay {
                continue;
            }

            for _ in 0..self.cfg.multiply.max(1) {
                self.send(&message);
            }
        }

        if let Some(record) = &mut self.record {
            let _ = record.flush();
        }
    }

    fn send(&self, message: &Bytes) {
        match &self.pool {
            Some(pool) => {
                if let Err(e) = pool.send(message) {
                    debug!("error while sending request: {e}");
                    if self.cfg.die_on_send_error {
                        error!("dying on connection error: {e}");
                        std::process::exit(1);
                    }
                }
            }
            None => self.send_oneshot(message),
        }
    }

    /// Default transport: one short-lived connection per message, raw
    /// payload, close. Failures are logged and the message is lost.
    fn send_oneshot(&self, message: &Bytes) {
        let mut conn = match connect_stream(&self.cfg.replay_address) {
            Ok(c) => c,
            Err(_) => {
                warn!("failed to send message; replay server not responding");
                return;
            }
        };
        if let Err(e) = conn.write_all(message) {
            warn!("error while sending request: {e}");
        }
    }
}

/// First line of a raw request, for verbose logging.
fn request_line(message: &[u8]) -> String {
    let end = message
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(message.len().min(120));
    String::from_utf8_lossy(&message[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    fn config(addr: &str) -> ShipperConfig {
        ShipperConfig {
            replay_address: addr.to_string(),
            replay_limit: 0,
            pool_size: 0,
            dgram: false,
            record_file: None,
            noreplay: false,
            multiply: 1,
            die_on_send_error: false,
            verbose: false,
        }
    }

    #[test]
    fn oneshot_sends_raw_bytes_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let shipper = Shipper::new(config(&path.to_string_lossy())).unwrap();
        let (tx, rx) = bounded(8);
        let shutdown = ShutdownFlag::default();
        tx.send(Bytes::from_static(b"GET /a HTTP/1.1\r\n\r\n")).unwrap();
        tx.send(Bytes::from_static(b"GET /b HTTP/1.1\r\n\r\n")).unwrap();
        drop(tx);

        let handle = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || shipper.run(rx, Statsd::disabled(), shutdown))
        };

        for expect in ["GET /a HTTP/1.1\r\n\r\n", "GET /b HTTP/1.1\r\n\r\n"] {
            let (mut conn, _) = listener.accept().unwrap();
            let mut got = Vec::new();
            conn.read_to_end(&mut got).unwrap();
            assert_eq!(got, expect.as_bytes());
        }
        handle.join().unwrap();
    }

    #[test]
    fn record_file_gets_one_framed_copy_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("requests.rec");

        let mut cfg = config("/nowhere.sock");
        cfg.record_file = Some(record_path.clone());
        cfg.noreplay = true;
        cfg.multiply = 3;
        let shipper = Shipper::new(cfg).unwrap();

        let (tx, rx) = bounded(8);
        tx.send(Bytes::from_static(b"GET /r HTTP/1.1\r\n\r\n")).unwrap();
        drop(tx);
        shipper.run(rx, Statsd::disabled(), ShutdownFlag::default());

        let mut file = File::open(&record_path).unwrap();
        let frame = framing::read_frame(&mut file).unwrap().unwrap();
        assert_eq!(&frame[..], b"GET /r HTTP/1.1\r\n\r\n");
        assert!(framing::read_frame(&mut file).unwrap().is_none());
    }

    #[test]
    fn multiply_fans_out_each_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut cfg = config(&path.to_string_lossy());
        cfg.multiply = 3;
        cfg.pool_size = 1;
        let shipper = Shipper::new(cfg).unwrap();

        let (tx, rx) = bounded(8);
        tx.send(Bytes::from_static(b"GET /m HTTP/1.1\r\n\r\n")).unwrap();
        drop(tx);
        let handle =
            std::thread::spawn(move || {
                shipper.run(rx, Statsd::disabled(), ShutdownFlag::default())
            });

        let (mut conn, _) = listener.accept().unwrap();
        for _ in 0..3 {
            let frame = framing::read_frame(&mut conn).unwrap().unwrap();
            assert_eq!(&frame[..], b"GET /m HTTP/1.1\r\n\r\n");
        }
        handle.join().unwrap();
    }

    #[test]
    fn request_line_extraction() {
        assert_eq!(
            request_line(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n"),
            "GET /x HTTP/1.1"
        );
        assert_eq!(request_line(b"no crlf here"), "no crlf here");
    }
}

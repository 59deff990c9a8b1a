// src/dispatch.rs
use crate::backlog::Backlog;
use crate::client_pool::build_client;
use crate::statsd::Statsd;
use crate::stats::ForwardHost;
use crate::util::{epoch_secs, ShutdownFlag};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MAX_HEADERS: usize = 64;

/// A wire request pulled apart just far enough to re-issue it.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

/// Parse one HTTP/1.x request from raw bytes. The body is whatever of the
/// declared content length is actually present in the frame.
pub fn parse_request(data: &[u8]) -> Option<ParsedRequest> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let httparse::Status::Complete(headers_end) = req.parse(data).ok()? else {
        return None;
    };

    let method = req.method?.to_string();
    let target = req.path?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut headers = Vec::with_capacity(req.headers.len());
    let mut content_length = 0usize;
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
        headers.push((h.name.to_string(), h.value.to_vec()));
    }

    let body_end = (headers_end + content_length).min(data.len());
    Some(ParsedRequest {
        method,
        path,
        query,
        headers,
        body: Bytes::copy_from_slice(&data[headers_end..body_end]),
    })
}

/// Rewrite the request target for the forward host. The `?` is appended
/// unconditionally, empty query or not.
pub fn build_url(host_url: &str, req: &ParsedRequest) -> String {
    format!("{}{}?{}", host_url, req.path, req.query)
}

/// Re-issue a parsed request and drain the response body (a half-read body
/// poisons keep-alive). Returns status and elapsed time.
fn send_request(
    client: &reqwest::blocking::Client,
    host_url: &str,
    req: &ParsedRequest,
    strip_connection: bool,
) -> anyhow::Result<(u16, Duration)> {
    let method = reqwest::Method::from_bytes(req.method.as_bytes())?;
    let mut builder = client.request(method, build_url(host_url, req));
    for (name, value) in &req.headers {
        // A pooled client must not inherit the sniffed Connection header.
        if strip_connection && name.eq_ignore_ascii_case("connection") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_slice());
    }
    if !req.body.is_empty() {
        builder = builder.body(req.body.to_vec());
    }

    let started = Instant::now();
    let response = builder.send()?;
    let status = response.status().as_u16();
    let _ = response.bytes()?;
    Ok((status, started.elapsed()))
}

/// Spawn the worker pool over the backlog. Targets the first forward host
/// only; the list form exists so the selection can grow without changing
/// the call sites.
pub fn spawn_workers(
    rx: Receiver<Bytes>,
    hosts: Arc<Vec<ForwardHost>>,
    n_workers: usize,
    timeout: Duration,
    statsd: Statsd,
    shutdown: ShutdownFlag,
) -> Vec<thread::JoinHandle<()>> {
    (0..n_workers.max(1))
        .map(|id| {
            let rx = rx.clone();
            let hosts = hosts.clone();
            let statsd = statsd.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker(id, rx, hosts, timeout, statsd, shutdown))
                .expect("spawn worker")
        })
        .collect()
}

fn worker(
    id: usize,
    rx: Receiver<Bytes>,
    hosts: Arc<Vec<ForwardHost>>,
    timeout: Duration,
    statsd: Statsd,
    shutdown: ShutdownFlag,
) {
    // Fallback for hosts without a client pool; one per worker, so even the
    // unpooled path never shares a client across threads.
    let own_client = match build_client(timeout) {
        Ok(c) => c,
        Err(e) => {
            log::error!("worker {id}: building http client: {e}");
            return;
        }
    };

    let mut bucket_epoch = epoch_secs();
    let mut bucket_count: u64 = 0;
    let mut window_start = Instant::now();
    let mut window_count: u64 = 0;

    while !shutdown.is_raised() {
        let frame = match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(f) => Some(f),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let now = epoch_secs();
        if now != bucket_epoch {
            statsd.inc("worker_output", bucket_count);
            bucket_epoch = now;
            bucket_count = 0;
        }
        if window_start.elapsed() >= Duration::from_secs(10) {
            info!(
                "worker {id}: average rps {}, qlen {}",
                window_count / 10,
                rx.len()
            );
            window_start = Instant::now();
            window_count = 0;
        }

        let Some(frame) = frame else { continue };
        let Some(request) = parse_request(&frame) else {
            debug!("unparseable request ({} bytes) dropped", frame.len());
            continue;
        };
        let Some(host) = hosts.first() else { continue };

        if !host.stats.admit(host.limit, epoch_secs()) {
            continue;
        }
        bucket_count += 1;
        window_count += 1;

        // Pinned slots need no locking: worker i is the only user of slot i.
        let (client, strip_connection) = match &host.clients {
            Some(pool) => (pool.pinned(id), true),
            None => (&own_client, false),
        };

        debug!("sending request: {} {}", request.method, build_url(&host.url, &request));
        match send_request(client, &host.url, &request, strip_connection) {
            Ok((status, elapsed)) => host.stats.record_response(status, elapsed),
            Err(e) => debug!("request error: {e}"),
        }
    }
}

/// Per-second backlog depth and drop telemetry.
pub fn spawn_backlog_telemetry(
    backlog: Backlog,
    statsd: Statsd,
    shutdown: ShutdownFlag,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("backlog-telemetry".into())
        .spawn(move || {
            let mut last_dropped = 0u64;
            while !shutdown.is_raised() {
                thread::sleep(Duration::from_secs(1));
                let dropped = backlog.dropped();
                statsd.gauge("backlog", backlog.depth() as u64);
                statsd.inc("dropped", dropped - last_dropped);
                last_dropped = dropped;
            }
        })
        .expect("spawn backlog telemetry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::HostStats;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn parse_get_with_query() {
        let req = parse_request(b"GET /search?q=traffic&page=2 HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/search");
        assert_eq!(req.query, "q=traffic&page=2");
        assert!(req.body.is_empty());
        assert_eq!(build_url("http://staging", &req), "http://staging/search?q=traffic&page=2");
    }

    #[test]
    fn parse_post_with_body() {
        let req = parse_request(
            b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello",
        )
        .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/u");
        assert_eq!(req.query, "");
        assert_eq!(&req.body[..], b"hello");
        // The `?` survives even with an empty query.
        assert_eq!(build_url("http://staging", &req), "http://staging/u?");
    }

    #[test]
    fn truncated_body_is_clamped_to_available_bytes() {
        let req = parse_request(
            b"POST /u HTTP/1.1\r\nContent-Length: 100\r\n\r\npartial",
        )
        .unwrap();
        assert_eq!(&req.body[..], b"partial");
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(parse_request(b"not an http request at all\r\n\r\n").is_none());
        assert!(parse_request(b"").is_none());
        assert!(parse_request(b"GET /incomplete HTTP/1.1\r\nHost: a").is_none());
    }

    /// Worker end to end: one frame through the backlog becomes one real
    /// upstream HTTP call whose status lands in the host stats.
    #[test]
    fn worker_replays_against_a_live_server() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let server_thread = thread::spawn(move || {
            let (mut conn, _) = server.accept().unwrap();
            let mut buf = [0u8; 4096];
            let mut seen = Vec::new();
            loop {
                let n = conn.read(&mut buf).unwrap();
                seen.extend_from_slice(&buf[..n]);
                if n == 0 || seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .unwrap();
            seen
        });

        let hosts = Arc::new(vec![ForwardHost {
            url: format!("http://{addr}"),
            limit: 0,
            stats: HostStats::default(),
            clients: None,
        }]);
        let (tx, rx) = crossbeam_channel::bounded(8);
        let shutdown = ShutdownFlag::default();
        let handles = spawn_workers(
            rx,
            hosts.clone(),
            1,
            Duration::from_secs(3),
            Statsd::disabled(),
            shutdown.clone(),
        );

        tx.send(Bytes::from_static(b"GET /mirrored?x=1 HTTP/1.1\r\nHost: origin\r\n\r\n"))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while hosts[0].stats.snapshot().responses == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let snap = hosts[0].stats.snapshot();
        assert_eq!(snap.responses, 1);
        assert_eq!(snap.codes, vec![(200, 1)]);

        let seen = server_thread.join().unwrap();
        let seen = String::from_utf8_lossy(&seen);
        assert!(seen.starts_with("GET /mirrored?x=1 HTTP/1.1\r\n"), "got: {seen}");
        assert!(seen.contains("host: origin") || seen.contains("Host: origin"), "got: {seen}");

        shutdown.raise();
        drop(tx);
        for h in handles {
            h.join().unwrap();
        }
    }
}

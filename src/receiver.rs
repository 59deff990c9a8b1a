// src/receiver.rs
use crate::backlog::Backlog;
use crate::framing;
use crate::util::epoch_secs;
use anyhow::Context;
use bytes::Bytes;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::thread;

const READ_BUF_SIZE: usize = 4096;

/// Bind the replay intake socket: an absolute path binds a UNIX listener,
/// anything else a TCP one. Returns after the bind so callers can fail
/// fast; accepting runs on a detached thread per connection.
pub fn spawn_listener(
    address: &str,
    persistent: bool,
    backlog: Backlog,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let handle = if address.starts_with('/') {
        // A previous run may have left the socket file behind.
        if Path::new(address).exists() {
            std::fs::remove_file(address).ok();
        }
        let listener = UnixListener::bind(address)
            .with_context(|| format!("binding unix socket {address}"))?;
        info!("replay server listening on unix:{address}");
        thread::Builder::new().name("receiver".into()).spawn(move || {
            for conn in listener.incoming() {
                match conn {
                    Ok(conn) => spawn_handler(conn, persistent, backlog.clone()),
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        })?
    } else {
        let listener =
            TcpListener::bind(address).with_context(|| format!("binding tcp {address}"))?;
        info!("replay server listening on tcp:{address}");
        thread::Builder::new().name("receiver".into()).spawn(move || {
            for conn in listener.incoming() {
                match conn {
                    Ok(conn) => spawn_handler(conn, persistent, backlog.clone()),
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        })?
    };
    Ok(handle)
}

fn spawn_handler<C: Read + Send + 'static>(conn: C, persistent: bool, backlog: Backlog) {
    thread::spawn(move || {
        if persistent {
            handle_persistent(conn, &backlog);
        } else {
            handle_oneshot(conn, &backlog);
        }
    });
}

/// One connection, one request: read until EOF or a short read, hand the
/// accumulated bytes over. A request split across reads larger than the
/// buffer gets truncated; the persistent transport is the framed fix.
fn handle_oneshot<C: Read>(mut conn: C, backlog: &Backlog) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut message = Vec::new();
    loop {
        match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                message.extend_from_slice(&buf[..n]);
                if n < READ_BUF_SIZE {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    if !message.is_empty() {
        backlog.add(Bytes::from(message));
    }
}

/// Long-lived connection carrying length-delimited frames. A deframe error
/// drops this connection only; other connections keep going.
fn handle_persistent<C: Read>(mut conn: C, backlog: &Backlog) {
    let mut bucket_epoch = epoch_secs();
    let mut bucket_count: u64 = 0;

    loop {
        let frame = match framing::read_frame(&mut conn) {
            Ok(Some(f)) => f,
            Ok(None) => return,
            Err(e) => {
                debug!("frame decode error: {e}; dropping connection");
                return;
            }
        };

        let now = epoch_secs();
        if now != bucket_epoch {
            info!("input: {bucket_count}/s");
            bucket_epoch = now;
            bucket_count = 0;
        }
        bucket_count += 1;

        backlog.add(frame);
    }
}

/// Feed the pipeline from a record file at decode speed until EOF. A
/// corrupt frame is fatal: a recorded workload that cannot be trusted is
/// not worth half-replaying.
pub fn run_file(path: &Path, backlog: &Backlog) -> anyhow::Result<()> {
    let file =
        File::open(path).with_context(|| format!("opening replay file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut bucket_epoch = epoch_secs();
    let mut bucket_count: u64 = 0;
    let mut total: u64 = 0;

    while let Some(frame) = framing::read_frame(&mut reader)
        .with_context(|| format!("replay file {} decode", path.display()))?
    {
        total += 1;
        let now = epoch_secs();
        if now != bucket_epoch {
            info!("input: {bucket_count}/s");
            bucket_epoch = now;
            bucket_count = 0;
        }
        bucket_count += 1;
        backlog.add(frame);
    }

    info!("read {total} requests from {}", path.display());
    Ok(())
}

// src/conn_pool.rs
use crate::framing;
use anyhow::Context;
use log::debug;
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::sync::Mutex;

/// The replay-address family rule, shared by every transport mode: an
/// absolute path is a UNIX socket, anything else is TCP.
pub enum StreamConn {
    Unix(UnixStream),
    Tcp(TcpStream),
}

pub fn connect_stream(address: &str) -> io::Result<StreamConn> {
    if address.starts_with('/') {
        Ok(StreamConn::Unix(UnixStream::connect(address)?))
    } else {
        Ok(StreamConn::Tcp(TcpStream::connect(address)?))
    }
}

impl Write for StreamConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// Fixed pool of long-lived sockets to the replay process. A send picks a
/// slot round-robin (cursor under the pool-wide lock), then serializes
/// against other senders on that slot only. A broken socket is reopened
/// and the send retried once; the second failure leaves the slot
/// disconnected and surfaces the error.
pub struct ConnectionPool {
    address: String,
    dgram: bool,
    slots: Vec<Mutex<Option<PoolSocket>>>,
    cursor: Mutex<usize>,
}

enum PoolSocket {
    Stream(StreamConn),
    Dgram(UnixDatagram),
}

impl PoolSocket {
    fn connect(address: &str, dgram: bool) -> anyhow::Result<Self> {
        if dgram {
            let sock = UnixDatagram::unbound()?;
            sock.connect(address)
                .with_context(|| format!("connecting datagram socket to {address}"))?;
            Ok(Self::Dgram(sock))
        } else {
            let sock = connect_stream(address)
                .with_context(|| format!("connecting to {address}"))?;
            Ok(Self::Stream(sock))
        }
    }

    /// Stream sockets carry length-delimited frames; datagram sockets carry
    /// the raw payload, one request per datagram.
    fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        match self {
            Self::Stream(stream) => {
                framing::write_frame(stream, payload)?;
                stream.flush()?;
            }
            Self::Dgram(sock) => {
                sock.send(payload)?;
            }
        }
        Ok(())
    }
}

impl ConnectionPool {
    pub fn new(address: String, size: usize, dgram: bool) -> Self {
        let slots = (0..size).map(|_| Mutex::new(None)).collect();
        Self { address, dgram, slots, cursor: Mutex::new(0) }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn next_index(&self) -> usize {
        let mut cursor = self.cursor.lock().unwrap();
        let index = *cursor;
        *cursor = (*cursor + 1) % self.slots.len();
        index
    }

    pub fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.send_on(self.next_index(), payload)
    }

    /// Send on a specific slot, reconnecting transparently. Connection
    /// state is per-slot; callers on other slots are unaffected.
    pub fn send_on(&self, index: usize, payload: &[u8]) -> anyhow::Result<()> {
        let mut slot = self.slots[index].lock().unwrap();

        if slot.is_none() {
            debug!("pool slot {index}: dialing {}", self.address);
            *slot = Some(PoolSocket::connect(&self.address, self.dgram)?);
        }

        match slot.as_mut().unwrap().send(payload) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("pool slot {index}: send failed ({e}), reconnecting"),
        }

        // Reconnect and retry once; a second failure disconnects the slot.
        *slot = None;
        let mut sock = PoolSocket::connect(&self.address, self.dgram)?;
        match sock.send(payload) {
            Ok(()) => {
                *slot = Some(sock);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("pool slot {index}: retry send failed")),
        }
    }
}

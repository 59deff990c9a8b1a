// src/statsd.rs
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

/// Statsd UDP client handle. Cheap to clone and pass into components; a
/// handle built with `disabled()` swallows every submission, so callers
/// never branch on whether metrics are configured.
#[derive(Clone)]
pub struct Statsd {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    sock: UdpSocket,
    addr: SocketAddr,
    prefix: String,
}

impl Statsd {
    pub fn new(addr: &str, prefix: String) -> anyhow::Result<Self> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("statsd address {addr} did not resolve"))?;
        Ok(Self { inner: Some(Arc::new(Inner { sock, addr, prefix })) })
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Increment a counter.
    pub fn inc(&self, stat: &str, value: u64) {
        self.submit(stat, &format!("{value}|c"));
    }

    /// Set a gauge.
    pub fn gauge(&self, stat: &str, value: u64) {
        self.submit(stat, &format!("{value}|g"));
    }

    fn submit(&self, stat: &str, value: &str) {
        let Some(inner) = &self.inner else { return };
        let data = if inner.prefix.is_empty() {
            format!("{stat}:{value}")
        } else {
            format!("{}.{stat}:{value}", inner.prefix)
        };
        // Metrics are best-effort; a lost datagram is not worth a log line.
        let _ = inner.sock.send_to(data.as_bytes(), inner.addr);
    }
}

/// `<tool>.<hostname>.<mode>` plus an optional user suffix.
pub fn make_prefix(mode: &str, user_prefix: Option<&str>) -> String {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let mut prefix = format!("{}.{hostname}.{mode}", env!("CARGO_PKG_NAME"));
    if let Some(extra) = user_prefix {
        if !extra.is_empty() {
            prefix.push('-');
            prefix.push_str(extra);
        }
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_wire_format() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = receiver.local_addr().unwrap();

        let client = Statsd::new(&addr.to_string(), "retap.host.listen".into()).unwrap();
        client.inc("output", 42);

        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"retap.host.listen.output:42|c");
    }

    #[test]
    fn disabled_client_is_silent() {
        let client = Statsd::disabled();
        client.inc("output", 1);
        client.gauge("backlog", 2);
    }

    #[test]
    fn prefix_with_user_suffix() {
        let p = make_prefix("replay", Some("canary"));
        assert!(p.starts_with("retap."));
        assert!(p.ends_with(".replay-canary"));
    }
}

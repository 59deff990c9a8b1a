// src/config.rs
use crate::client_pool::ClientPool;
use crate::stats::{ForwardHost, HostStats};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "retap", version, about = "Mirror live HTTP traffic to staging targets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sniff HTTP traffic on an interface and ship it to a replay server
    Listen(ListenArgs),
    /// Receive mirrored requests and forward them to staging targets
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Network interface to capture on
    #[arg(short = 'i', long, default_value = "lo")]
    pub interface: String,

    /// HTTP server port whose traffic to capture
    #[arg(short = 'p', long, default_value_t = 80)]
    pub port: u16,

    /// Replay server address; append `|limit` to cap shipped requests per second
    #[arg(short = 'r', long, default_value = "localhost:28020")]
    pub replay_address: String,

    /// BPF capture filter (defaults to `tcp dst port <port>`)
    #[arg(long)]
    pub pcap_filter: Option<String>,

    /// Log every captured request
    #[arg(long)]
    pub verbose: bool,

    /// Ship unix datagrams instead of stream connections
    #[arg(long)]
    pub dgram: bool,

    /// Capture (and record) only; do not ship to the replay server
    #[arg(long)]
    pub noreplay: bool,

    /// Skip TCP reassembly; forward single segments that look like requests
    #[arg(long = "no-reasm")]
    pub no_reasm: bool,

    /// Persistent connection pool size (0 = one connection per message)
    #[arg(long, default_value_t = 0)]
    pub pool_size: usize,

    /// Cap on captured packets per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub packet_limit: u64,

    /// Append every captured request to this file as length-delimited frames
    #[arg(long)]
    pub record_file: Option<PathBuf>,

    /// Exit instead of dropping when a pooled send cannot reach the replay server
    #[arg(long = "die-if-replay-server-is-unreachable")]
    pub die_if_replay_server_is_unreachable: bool,

    /// Ship each captured request this many times
    #[arg(long, default_value_t = 1)]
    pub multiply: usize,

    /// statsd endpoint (host:port)
    #[arg(long)]
    pub statsd: Option<String>,

    /// Extra statsd prefix component, appended after `retap.<hostname>.<mode>`
    #[arg(long)]
    pub statsd_prefix: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Address to listen on: `host:port` for TCP, an absolute path for UNIX
    #[arg(long = "ip", default_value = "localhost:28020")]
    pub address: String,

    /// Comma-separated forward targets, each with an optional `|rps` limit
    #[arg(short = 'f', long = "forward", default_value = "http://localhost:8080")]
    pub forward: String,

    /// Replay requests from a record file instead of a socket
    #[arg(long)]
    pub replay_file: Option<PathBuf>,

    /// Log every forwarded request
    #[arg(long)]
    pub verbose: bool,

    /// Expect length-delimited frames on long-lived connections
    #[arg(long)]
    pub persistent_connections: bool,

    /// Worker count and keep-alive client pool size (0 = one worker, no pool)
    #[arg(long, default_value_t = 0)]
    pub client_pool_size: usize,

    /// Capacity of the request backlog between receiver and workers
    #[arg(long, default_value_t = 4000)]
    pub backlog_size: usize,

    /// Upstream per-request deadline in seconds
    #[arg(long, default_value_t = 3)]
    pub timeout: u64,

    /// statsd endpoint (host:port)
    #[arg(long)]
    pub statsd: Option<String>,

    /// Extra statsd prefix component, appended after `retap.<hostname>.<mode>`
    #[arg(long)]
    pub statsd_prefix: Option<String>,
}

/// Resolved listener settings: the raw flags with the `|limit` suffix and
/// filter default folded in, validated.
#[derive(Debug)]
pub struct ListenSettings {
    pub interface: String,
    pub port: u16,
    pub replay_address: String,
    pub replay_limit: u64,
    pub pcap_filter: String,
    pub verbose: bool,
    pub dgram: bool,
    pub noreplay: bool,
    pub no_reasm: bool,
    pub pool_size: usize,
    pub packet_limit: u64,
    pub record_file: Option<PathBuf>,
    pub die_if_replay_server_is_unreachable: bool,
    pub multiply: usize,
    pub statsd: Option<String>,
    pub statsd_prefix: Option<String>,
}

impl ListenSettings {
    pub fn from_args(args: ListenArgs) -> anyhow::Result<Self> {
        let (replay_address, replay_limit) = split_limit(&args.replay_address)?;
        let pcap_filter = args
            .pcap_filter
            .unwrap_or_else(|| format!("tcp dst port {}", args.port));

        let settings = Self {
            interface: args.interface,
            port: args.port,
            replay_address,
            replay_limit,
            pcap_filter,
            verbose: args.verbose,
            dgram: args.dgram,
            noreplay: args.noreplay,
            no_reasm: args.no_reasm,
            pool_size: args.pool_size,
            packet_limit: args.packet_limit,
            record_file: args.record_file,
            die_if_replay_server_is_unreachable: args.die_if_replay_server_is_unreachable,
            multiply: args.multiply,
            statsd: args.statsd,
            statsd_prefix: args.statsd_prefix,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.multiply == 0 {
            anyhow::bail!("--multiply must be at least 1");
        }
        if self.dgram && !self.replay_address.starts_with('/') {
            anyhow::bail!("--dgram requires a unix socket path replay address");
        }
        if self.dgram && self.pool_size == 0 {
            anyhow::bail!("--dgram requires --pool-size > 0");
        }
        Ok(())
    }
}

/// Resolved replay settings.
#[derive(Debug)]
pub struct ReplaySettings {
    pub address: String,
    pub forward: String,
    pub replay_file: Option<PathBuf>,
    pub verbose: bool,
    pub persistent_connections: bool,
    pub client_pool_size: usize,
    pub backlog_size: usize,
    pub timeout: Duration,
    pub statsd: Option<String>,
    pub statsd_prefix: Option<String>,
}

impl ReplaySettings {
    pub fn from_args(args: ReplayArgs) -> anyhow::Result<Self> {
        let settings = Self {
            address: args.address,
            forward: args.forward,
            replay_file: args.replay_file,
            verbose: args.verbose,
            persistent_connections: args.persistent_connections,
            client_pool_size: args.client_pool_size,
            backlog_size: args.backlog_size,
            timeout: Duration::from_secs(args.timeout),
            statsd: args.statsd,
            statsd_prefix: args.statsd_prefix,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.forward.trim().is_empty() {
            anyhow::bail!("--forward must name at least one target");
        }
        if self.backlog_size < 200 {
            anyhow::bail!("--backlog-size must be at least 200");
        }
        if self.timeout.is_zero() {
            anyhow::bail!("--timeout must be at least 1 second");
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.client_pool_size.max(1)
    }

    /// Parse `-f "host1,http://host2|10"` into live forward targets.
    /// Dispatch sends to the first host only, so keep-alive client pools
    /// are built for that host alone; pools on unreachable hosts would
    /// just pin idle state.
    pub fn forwarded_hosts(&self) -> anyhow::Result<Vec<ForwardHost>> {
        let mut hosts = Vec::new();
        for (index, target) in self.forward.split(',').enumerate() {
            let (mut url, limit) = split_limit(target)?;
            if !url.contains("http") {
                url = format!("http://{url}");
            }
            let clients = if self.client_pool_size > 0 && index == 0 {
                Some(ClientPool::new(self.client_pool_size, self.timeout)?)
            } else {
                None
            };
            hosts.push(ForwardHost {
                url,
                limit,
                stats: HostStats::default(),
                clients,
            });
        }
        Ok(hosts)
    }
}

/// Split an `address|limit` pair; a missing suffix means unlimited.
fn split_limit(address: &str) -> anyhow::Result<(String, u64)> {
    match address.split_once('|') {
        Some((addr, limit)) => {
            let limit = limit
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid rate limit in {address:?}"))?;
            Ok((addr.to_string(), limit))
        }
        None => Ok((address.to_string(), 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen_args(extra: &[&str]) -> ListenArgs {
        let mut argv = vec!["retap", "listen"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Listen(args) => args,
            _ => unreachable!(),
        }
    }

    fn replay_args(extra: &[&str]) -> ReplayArgs {
        let mut argv = vec!["retap", "replay"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Replay(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn listen_defaults() {
        let s = ListenSettings::from_args(listen_args(&[])).unwrap();
        assert_eq!(s.interface, "lo");
        assert_eq!(s.port, 80);
        assert_eq!(s.replay_address, "localhost:28020");
        assert_eq!(s.replay_limit, 0);
        assert_eq!(s.pcap_filter, "tcp dst port 80");
        assert_eq!(s.multiply, 1);
    }

    #[test]
    fn replay_address_limit_suffix() {
        let s =
            ListenSettings::from_args(listen_args(&["-r", "/tmp/replay.sock|250"])).unwrap();
        assert_eq!(s.replay_address, "/tmp/replay.sock");
        assert_eq!(s.replay_limit, 250);
    }

    #[test]
    fn filter_follows_the_port() {
        let s = ListenSettings::from_args(listen_args(&["-p", "8080"])).unwrap();
        assert_eq!(s.pcap_filter, "tcp dst port 8080");
        let s = ListenSettings::from_args(listen_args(&["-p", "8080", "--pcap-filter", "tcp"]))
            .unwrap();
        assert_eq!(s.pcap_filter, "tcp");
    }

    #[test]
    fn dgram_needs_a_unix_path_and_a_pool() {
        assert!(ListenSettings::from_args(listen_args(&["--dgram"])).is_err());
        assert!(ListenSettings::from_args(listen_args(&[
            "--dgram",
            "-r",
            "/tmp/replay.sock"
        ]))
        .is_err());
        assert!(ListenSettings::from_args(listen_args(&[
            "--dgram",
            "-r",
            "/tmp/replay.sock",
            "--pool-size",
            "4"
        ]))
        .is_ok());
    }

    #[test]
    fn forwarded_hosts_parse_limits_and_schemes() {
        let s = ReplaySettings::from_args(replay_args(&[
            "-f",
            "staging.example.com|100,http://dev.example.com|10,bare.example.com",
        ]))
        .unwrap();
        let hosts = s.forwarded_hosts().unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].url, "http://staging.example.com");
        assert_eq!(hosts[0].limit, 100);
        assert_eq!(hosts[1].url, "http://dev.example.com");
        assert_eq!(hosts[1].limit, 10);
        assert_eq!(hosts[2].url, "http://bare.example.com");
        assert_eq!(hosts[2].limit, 0);
        assert!(hosts.iter().all(|h| h.clients.is_none()));
    }

    #[test]
    fn client_pool_size_builds_a_pool_for_the_dispatched_host() {
        let s = ReplaySettings::from_args(replay_args(&[
            "-f",
            "http://staging,http://dev|10",
            "--client-pool-size",
            "4",
        ]))
        .unwrap();
        let hosts = s.forwarded_hosts().unwrap();
        assert_eq!(hosts[0].clients.as_ref().unwrap().len(), 4);
        // Only the first host is ever dispatched to; no pool for the rest.
        assert!(hosts[1].clients.is_none());
        assert_eq!(s.worker_count(), 4);
    }

    #[test]
    fn bad_limit_is_rejected() {
        let s = ReplaySettings::from_args(replay_args(&["-f", "http://staging|fast"]));
        assert!(s.is_err() || s.unwrap().forwarded_hosts().is_err());
    }
}

use std::io::Write;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

// Synthetic load for a replay server running with --persistent-connections:
// writes length-delimited GET requests at a target rate.
fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: reqburst <address> <requests> <rate_rps> [path]");
        std::process::exit(2);
    }
    let address = &args[1];
    let requests: u64 = args[2].parse()?;
    let rate_rps: u64 = args[3].parse()?;
    let path = args.get(4).map(String::as_str).unwrap_or("/");

    let mut conn: Box<dyn Write> = if address.starts_with('/') {
        Box::new(UnixStream::connect(address)?)
    } else {
        Box::new(TcpStream::connect(address)?)
    };

    let nanos_per_req = if rate_rps == 0 {
        0
    } else {
        1_000_000_000u64 / rate_rps
    };
    let start = std::time::Instant::now();
    for i in 0..requests {
        let payload = format!("GET {path}?n={i} HTTP/1.1\r\nHost: reqburst\r\n\r\n");
        conn.write_all(&(payload.len() as u32).to_be_bytes())?;
        conn.write_all(payload.as_bytes())?;
        if nanos_per_req > 0 {
            busy_sleep_nanos(nanos_per_req);
        }
    }
    conn.flush()?;
    eprintln!("sent {} requests in {:?}", requests, start.elapsed());
    Ok(())
}

#[inline]
fn busy_sleep_nanos(ns: u64) {
    let start = std::time::Instant::now();
    loop {
        if start.elapsed().as_nanos() as u64 >= ns {
            break;
        }
        std::hint::spin_loop();
    }
}

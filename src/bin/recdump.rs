use std::fs::File;
use std::io::{BufReader, Read};

// Inspect a record file: one line per frame with its size and request line.
fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: recdump <record_file>");
        std::process::exit(2);
    }

    let file = File::open(&args[1])?;
    let mut reader = BufReader::new(file);
    let mut index = 0u64;
    let mut total_bytes = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let line_end = payload
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(payload.len().min(120));
        println!(
            "{:>6}  {:>7} bytes  {}",
            index,
            len,
            String::from_utf8_lossy(&payload[..line_end])
        );
        index += 1;
        total_bytes += len as u64;
    }
    eprintln!("{} requests, {} payload bytes", index, total_bytes);
    Ok(())
}

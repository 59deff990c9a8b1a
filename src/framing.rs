// src/framing.rs
//
// The one framing used everywhere a request crosses a byte stream: the
// persistent listener->replay transport and the record file. Four-byte
// big-endian length, then the raw request bytes.
use bytes::Bytes;
use std::io::{self, Read, Write};

/// Upper bound on a single frame. A length above this is treated as stream
/// corruption rather than an allocation request.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(payload)
}

/// Read one frame. `Ok(None)` means clean EOF (stream ended on a frame
/// boundary); EOF inside a frame is an error.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME}"),
        ));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some(Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip_byte_identical() {
        let frames: Vec<&[u8]> = vec![
            b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n",
            b"",
            b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        ];
        let mut buf = Vec::new();
        for f in &frames {
            write_frame(&mut buf, f).unwrap();
        }

        let mut cur = Cursor::new(buf);
        for f in &frames {
            let got = read_frame(&mut cur).unwrap().unwrap();
            assert_eq!(&got[..], *f);
        }
        assert!(read_frame(&mut cur).unwrap().is_none());
    }

    #[test]
    fn eof_inside_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"truncated payload").unwrap();
        buf.truncate(buf.len() - 3);
        let mut cur = Cursor::new(buf);
        assert!(read_frame(&mut cur).is_err());

        // EOF inside the header itself.
        let mut cur = Cursor::new(vec![0u8, 0, 0]);
        assert!(read_frame(&mut cur).is_err());
    }

    #[test]
    fn absurd_length_is_rejected() {
        let mut buf = Vec::from(u32::MAX.to_be_bytes());
        buf.extend_from_slice(b"junk");
        let mut cur = Cursor::new(buf);
        assert!(read_frame(&mut cur).is_err());
    }
}

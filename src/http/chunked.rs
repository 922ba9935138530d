//! Chunked transfer-coding removal
//!
//! HTTP/2 has no chunked framing, so a raw packet that carries a chunked
//! body is de-chunked before it is split into DATA frames. The decoder is
//! lenient: bare `\n` line endings are accepted, chunk extensions ignored,
//! and a truncated body yields what was decoded so far.

use super::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Result of de-chunking a complete buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dechunked {
    /// Concatenated chunk payloads
    pub body: Bytes,
    /// Whether the terminating zero-size chunk was seen
    pub complete: bool,
}

/// Find the end of the line starting at `pos`; returns (line_end, next_line_start)
fn line_end(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    let nl = buf[pos..].iter().position(|&b| b == b'\n')? + pos;
    let end = if nl > pos && buf[nl - 1] == b'\r' { nl - 1 } else { nl };
    Some((end, nl + 1))
}

/// Remove chunked framing from `input`
///
/// Fails only when a chunk-size line is not hexadecimal.
pub fn dechunk(input: &[u8]) -> Result<Dechunked> {
    let mut body = BytesMut::with_capacity(input.len());
    let mut pos = 0;

    loop {
        let Some((end, next)) = line_end(input, pos) else {
            return Ok(Dechunked { body: body.freeze(), complete: false });
        };

        let line = String::from_utf8_lossy(&input[pos..end]);
        let size_str = line.split(';').next().unwrap_or("").trim();
        if size_str.is_empty() {
            // tolerate stray blank lines between chunks
            pos = next;
            continue;
        }
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;
        pos = next;

        if size == 0 {
            // trailers are dropped; only completion matters
            return Ok(Dechunked { body: body.freeze(), complete: true });
        }

        let available = input.len().saturating_sub(pos).min(size);
        body.put_slice(&input[pos..pos + available]);
        pos += available;
        if available < size {
            return Ok(Dechunked { body: body.freeze(), complete: false });
        }

        // skip the CRLF that closes the chunk data
        if input[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if input[pos..].starts_with(b"\n") {
            pos += 1;
        }
    }
}

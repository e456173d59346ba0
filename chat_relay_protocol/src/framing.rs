// Length-delimited message framing for stream transports.
//
// A datagram transport hands the relay whole messages; a byte stream does
// not. This module restores message boundaries: a 4-byte big-endian length
// prefix followed by the encoded payload (see `message.rs`). Both functions
// work on raw bytes and leave encoding to the caller.
//
// `MAX_MESSAGE_SIZE` matches the largest message the relay's transport is
// willing to send (512 KB) and keeps a corrupt length prefix from turning
// into a huge allocation.

use std::io::{self, Read, Write};

/// Maximum allowed message size (512 KB).
pub const MAX_MESSAGE_SIZE: u32 = 512 * 1024;

const PREFIX_LEN: usize = 4;

fn too_large(kind: io::ErrorKind, len: usize) -> io::Error {
    io::Error::new(
        kind,
        format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
    )
}

/// Write one frame and flush. Fails with `InvalidInput` (writing nothing) if
/// `msg` is over `MAX_MESSAGE_SIZE`.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| too_large(io::ErrorKind::InvalidInput, msg.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(msg)?;
    writer.flush()
}

/// Read one frame.
///
/// `UnexpectedEof` if the stream ends before or inside a frame, `InvalidData`
/// if the prefix announces more than `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_MESSAGE_SIZE {
        return Err(too_large(io::ErrorKind::InvalidData, len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

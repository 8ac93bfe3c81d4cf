//! Wire codec: length-prefixed framing and the bulk CSV row dialect.
//!
//! Frame format, repeated per message:
//!
//! ```text
//! [u32 BE payload length] [payload bytes]
//! ```
//!
//! Payloads are UTF-8 JSON for commands and acknowledgements, and UTF-8 CSV
//! (custom dialect, see [`csv`]) for bulk row data. The codec itself imposes
//! no payload size cap; payload sizes are caller-controlled.

pub mod csv;

use std::io::{ErrorKind, Read, Write};

use crate::error::{PyBridgeError, Result};

/// Write one length-prefixed frame.
pub fn write_frame(sink: &mut impl Write, payload: &[u8]) -> Result<()> {
    sink.write_all(&(payload.len() as u32).to_be_bytes())?;
    sink.write_all(payload)?;
    sink.flush()?;
    Ok(())
}

/// Read one length-prefixed frame, blocking until the full payload arrives.
///
/// Fails with [`PyBridgeError::TruncatedStream`] if the peer closes the
/// stream inside the length prefix or the payload.
pub fn read_frame(source: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    read_exact_or_truncated(source, &mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    read_exact_or_truncated(source, &mut payload)?;
    Ok(payload)
}

fn read_exact_or_truncated(source: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    source.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            PyBridgeError::TruncatedStream
        } else {
            PyBridgeError::Io(e)
        }
    })
}

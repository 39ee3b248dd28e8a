//! Length-prefixed framing for stream transports.
//!
//! ```text
//! [u32 BE: len][encoded Message of len bytes]
//! ```

use crate::config::ServerConfig;
use crate::error::{PsError, Result};
use crate::message::HEADER_LEN;
use std::io::{ErrorKind, Read, Write};

/// Read one frame.
///
/// Returns `None` on clean EOF (peer closed the connection before a new
/// frame started).
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > ServerConfig::MAX_MESSAGE_SIZE + HEADER_LEN {
        return Err(PsError::format(format!(
            "frame size {} exceeds maximum {}",
            len,
            ServerConfig::MAX_MESSAGE_SIZE + HEADER_LEN
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

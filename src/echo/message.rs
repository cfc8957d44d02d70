//! Messages travel as a fixed [`BUFFER_SIZE`]-byte buffer holding
//! NUL-terminated text. There is no length field: a message that fills the
//! whole buffer carries no terminator, and anything after an embedded NUL
//! is not part of the text.

use std::borrow::Cow;

/// Size of every message buffer, in bytes.
pub const BUFFER_SIZE: usize = 1024;

/// Copy `msg` into `buf`, truncating it to the buffer and zero-padding the
/// tail. Returns the number of bytes copied.
pub fn fill(buf: &mut [u8], msg: &[u8]) -> usize {
    let len = msg.len().min(buf.len());
    buf[..len].copy_from_slice(&msg[..len]);
    buf[len..].fill(0);
    len
}

/// The text in `buf`: everything up to the first NUL, or the whole buffer.
pub fn text(buf: &[u8]) -> Cow<'_, str> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end])
}

//! Primitive field encoders/decoders shared by the handshake packet bodies:
//! varint-prefixed UTF-8 strings and varint-prefixed byte arrays. These sit
//! on top of [`crate::framing::read_varint`]/[`write_varint`] the same way
//! the framing layer's varint sits under the frame length prefix.

use crate::error::{ProxyError, Result};
use crate::framing::{read_varint, write_varint};

/// Reads a varint-length-prefixed UTF-8 string, returning the decoded
/// string and the number of bytes consumed from `data`.
pub fn read_string(data: &[u8]) -> Result<(String, usize)> {
    let (len, len_bytes) = read_varint(data)?
        .ok_or_else(|| ProxyError::framing("truncated string length"))?;
    let len = len as usize;
    let total = len_bytes + len;
    if data.len() < total {
        return Err(ProxyError::framing("truncated string body"));
    }
    let s = String::from_utf8(data[len_bytes..total].to_vec())
        .map_err(|e| ProxyError::framing(format!("invalid UTF-8 string: {e}")))?;
    Ok((s, total))
}

/// Writes `s` as a varint-length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

/// Reads a varint-length-prefixed byte array, returning the bytes and the
/// number of bytes consumed from `data`.
pub fn read_bytes(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let (len, len_bytes) = read_varint(data)?
        .ok_or_else(|| ProxyError::framing("truncated byte-array length"))?;
    let len = len as usize;
    let total = len_bytes + len;
    if data.len() < total {
        return Err(ProxyError::framing("truncated byte-array body"));
    }
    Ok((data[len_bytes..total].to_vec(), total))
}

/// Writes `bytes` as a varint-length-prefixed byte array.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

//! Length-prefixed frame codec with an optional zlib compression envelope.
//!
//! Wire shape:
//!
//! ```text
//! varint(frame_len) [ varint(declared_uncompressed_len) ] payload
//! ```
//!
//! The inner `declared_uncompressed_len` prefix only appears once
//! compression is enabled for the session. `0` means the payload that
//! follows is stored raw; non-zero means it is zlib-compressed and must
//! inflate to exactly that many bytes.

use crate::error::{ProxyError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Guard against pathological varints: reject anything longer than 5 bytes.
const MAX_VARINT_BYTES: usize = 5;

/// 4 MiB. Not dictated by the wire format; chosen as a generous but finite
/// cap so a corrupt or adversarial length prefix can't force an unbounded
/// allocation.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Reads a 7-bit-group, MSB-continuation varint from the front of `data`.
///
/// Returns `Ok(None)` if `data` doesn't yet hold a complete varint (caller
/// should wait for more bytes), `Ok(Some((value, bytes_consumed)))` on
/// success, or an error if the varint is malformed or too long.
pub fn read_varint(data: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let Some(&byte) = data.get(i) else {
            return Ok(None);
        };
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(ProxyError::framing("varint longer than 5 bytes"))
}

/// Writes `value` as a 7-bit-group, MSB-continuation varint.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn varint_len(value: u32) -> usize {
    let mut v = value;
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Attempts to pull one complete frame's raw payload (post length-prefix,
/// pre-compression) out of `buf`, draining the consumed bytes on success.
/// Returns `Ok(None)` when `buf` holds an incomplete frame.
fn take_frame_payload(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    let Some((len, len_bytes)) = read_varint(buf)? else {
        return Ok(None);
    };
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProxyError::framing(format!(
            "frame payload of {len} bytes exceeds the {MAX_FRAME_LEN} byte cap"
        )));
    }
    let total = len_bytes + len;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = buf[len_bytes..total].to_vec();
    buf.drain(..total);
    Ok(Some(payload))
}

/// Decodes one frame's packet body (the bytes starting with the packet-id
/// varint) out of `buf`, applying the compression envelope when
/// `compression_enabled`. Returns `Ok(None)` if `buf` holds an incomplete
/// frame; never produces a spurious frame from partial input.
pub fn decode_frame(buf: &mut Vec<u8>, compression_enabled: bool) -> Result<Option<Vec<u8>>> {
    let Some(raw) = take_frame_payload(buf)? else {
        return Ok(None);
    };

    if !compression_enabled {
        return Ok(Some(raw));
    }

    let Some((declared_len, prefix_bytes)) = read_varint(&raw)? else {
        return Err(ProxyError::framing(
            "compressed frame missing declared-uncompressed-length prefix",
        ));
    };
    let body = &raw[prefix_bytes..];

    if declared_len == 0 {
        Ok(Some(body.to_vec()))
    } else {
        let mut out = Vec::with_capacity(declared_len as usize);
        ZlibDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(|e| ProxyError::framing(format!("zlib inflate failed: {e}")))?;
        if out.len() != declared_len as usize {
            return Err(ProxyError::framing(format!(
                "decompressed length {} does not match declared length {}",
                out.len(),
                declared_len
            )));
        }
        Ok(Some(out))
    }
}

/// Encodes `body` (a packet-id varint followed by packet payload) as a
/// complete frame with no compression envelope — used before compression
/// has been toggled on for the session.
pub fn encode_frame_plain(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    write_varint(&mut out, body.len() as u32);
    out.extend_from_slice(body);
    out
}

/// Encodes `body` with the compression envelope: bodies `>= threshold` are
/// zlib-compressed with a non-zero declared length; everything else is
/// written raw behind a zero declared length.
///
/// Passing a `threshold` larger than any real body (e.g. `u32::MAX`)
/// produces the envelope-present-but-nothing-compressed framing the login
/// phase needs for the frames straddling the compression toggle.
pub fn encode_frame_compressed(body: &[u8], threshold: u32) -> Result<Vec<u8>> {
    let mut envelope = Vec::new();
    if body.len() as u64 >= u64::from(threshold) {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(body)
            .map_err(|e| ProxyError::framing(format!("zlib deflate failed: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| ProxyError::framing(format!("zlib deflate failed: {e}")))?;
        write_varint(&mut envelope, body.len() as u32);
        envelope.extend_from_slice(&compressed);
    } else {
        write_varint(&mut envelope, 0);
        envelope.extend_from_slice(body);
    }

    let mut out = Vec::with_capacity(envelope.len() + 5);
    write_varint(&mut out, envelope.len() as u32);
    out.extend_from_slice(&envelope);
    Ok(out)
}

/// Encodes `body` the way the two login-phase packets that straddle the
/// compression toggle (`SetCompression` itself and the frame after it)
/// must be sent: if compression is enabled for the session, wrapped in the
/// `(declared_uncompressed_len, payload)` envelope with
/// `declared_uncompressed_len = 0` and the raw body; if compression isn't
/// enabled yet, there's no envelope to begin with.
///
/// Per spec §4.1, these frames are never actually deflated regardless of
/// how their body size compares to the session's real threshold — unlike
/// [`encode_frame_compressed`], which applies the size-vs-threshold rule.
pub fn encode_frame_never_compressed(body: &[u8], compression_enabled: bool) -> Result<Vec<u8>> {
    if compression_enabled {
        // A threshold no real body can ever reach forces the envelope's
        // "stored raw" branch every time.
        encode_frame_compressed(body, u32::MAX)
    } else {
        Ok(encode_frame_plain(body))
    }
}

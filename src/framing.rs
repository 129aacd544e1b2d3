//! Length-prefixed binary framing used by the broadcast channel.
//!
//! Header layout (big-endian, 16 bytes): total length (4), header length
//! (2, always 16), protocol version (2), operation (4), sequence (4).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

pub const HEADER_LEN: u32 = 16;

pub const VERSION_PLAIN: u16 = 1;
pub const VERSION_BROTLI: u16 = 3;
// Accepted for backward compatibility with older broadcast-server revisions.
const VERSION_ZLIB: u16 = 2;

pub const OP_HEARTBEAT: u32 = 2;
pub const OP_HEARTBEAT_REPLY: u32 = 3;
pub const OP_MESSAGE: u32 = 5;
pub const OP_AUTH: u32 = 7;
pub const OP_AUTH_REPLY: u32 = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("buffer shorter than declared frame length")]
    Truncated,
    #[error("io error while reading frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("brotli decompression failed: {0}")]
    Brotli(std::io::Error),
    #[error("zlib decompression failed: {0}")]
    Zlib(std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u16,
    pub operation: u32,
    pub sequence: u32,
    pub body: Vec<u8>,
}

/// Encode a single plaintext frame (used for the outbound auth/heartbeat
/// frames; the coordinator never receives compressed frames from us).
pub fn encode(operation: u32, sequence: u32, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN as usize + body.len());
    packet
        .write_u32::<BigEndian>(HEADER_LEN + body.len() as u32)
        .unwrap();
    packet.write_u16::<BigEndian>(HEADER_LEN as u16).unwrap();
    packet.write_u16::<BigEndian>(VERSION_PLAIN).unwrap();
    packet.write_u32::<BigEndian>(operation).unwrap();
    packet.write_u32::<BigEndian>(sequence).unwrap();
    packet.extend_from_slice(body);
    packet
}

/// Decode every frame in `data`, recursively expanding brotli/zlib-compressed
/// payloads into their constituent frames. Never re-decompresses an already
/// decompressed buffer: the recursive call below always receives plaintext
/// extracted from a single compressed body, so a second pass over it only
/// ever sees `VERSION_PLAIN` (or `VERSION_ZLIB`/`VERSION_BROTLI` again if the
/// server genuinely nested compression, which is handled the same way).
pub fn decode_all(data: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut cursor = Cursor::new(data);

    while (cursor.position() as usize) < data.len() {
        let start = cursor.position() as usize;
        if data.len() - start < HEADER_LEN as usize {
            return Err(FrameError::Truncated);
        }

        let total_len = cursor.read_u32::<BigEndian>()?;
        let header_len = cursor.read_u16::<BigEndian>()?;
        let version = cursor.read_u16::<BigEndian>()?;
        let operation = cursor.read_u32::<BigEndian>()?;
        let sequence = cursor.read_u32::<BigEndian>()?;

        if data.len() - start < total_len as usize {
            return Err(FrameError::Truncated);
        }

        let body_len = total_len as usize - header_len as usize;
        let mut body = vec![0u8; body_len];
        cursor.read_exact(&mut body)?;

        match version {
            VERSION_BROTLI => {
                let plain = decompress_brotli(&body)?;
                frames.extend(decode_all(&plain)?);
            }
            VERSION_ZLIB => {
                let plain = decompress_zlib(&body)?;
                frames.extend(decode_all(&plain)?);
            }
            _ => frames.push(Frame {
                version,
                operation,
                sequence,
                body,
            }),
        }

        cursor.set_position((start + total_len as usize) as u64);
    }

    Ok(frames)
}

fn decompress_brotli(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut decoder = brotli::Decompressor::new(body, 4096);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(FrameError::Brotli)?;
    Ok(out)
}

fn decompress_zlib(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut decoder = flate2::read::ZlibDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(FrameError::Zlib)?;
    Ok(out)
}

/// Parse the big-endian integer payload of an attention (op=3, v=1) frame.
pub fn parse_attention(body: &[u8]) -> Option<u32> {
    if body.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain_frame() {
        let packet = encode(OP_HEARTBEAT, 1, b"[object Object]");
        let frames = decode_all(&packet).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].operation, OP_HEARTBEAT);
        assert_eq!(frames[0].body, b"[object Object]");
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let packet = encode(OP_MESSAGE, 1, b"hello");
        let truncated = &packet[..packet.len() - 2];
        assert!(matches!(
            decode_all(truncated),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn parses_attention_payload() {
        let body = 42u32.to_be_bytes();
        assert_eq!(parse_attention(&body), Some(42));
    }

    #[test]
    fn decodes_two_concatenated_plain_frames() {
        let mut buf = encode(OP_MESSAGE, 1, br#"{"cmd":"LIVE"}"#);
        buf.extend(encode(OP_MESSAGE, 2, br#"{"cmd":"PREPARING"}"#));
        let frames = decode_all(&buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body, br#"{"cmd":"LIVE"}"#);
        assert_eq!(frames[1].body, br#"{"cmd":"PREPARING"}"#);
    }

    #[test]
    fn decodes_brotli_compressed_aggregate() {
        let mut inner = encode(OP_MESSAGE, 1, br#"{"cmd":"LIVE"}"#);
        inner.extend(encode(
            OP_MESSAGE,
            2,
            br#"{"cmd":"DANMU_MSG","info":[[0,0,0,0,0,0,0,0,0,0]]}"#,
        ));

        let mut compressed = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut compressed, 4096, 9, 22);
            std::io::Write::write_all(&mut writer, &inner).unwrap();
        }

        let mut outer = Vec::new();
        outer
            .write_u32::<BigEndian>(HEADER_LEN + compressed.len() as u32)
            .unwrap();
        outer.write_u16::<BigEndian>(HEADER_LEN as u16).unwrap();
        outer.write_u16::<BigEndian>(VERSION_BROTLI).unwrap();
        outer.write_u32::<BigEndian>(OP_MESSAGE).unwrap();
        outer.write_u32::<BigEndian>(1).unwrap();
        outer.extend_from_slice(&compressed);

        let frames = decode_all(&outer).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].body.starts_with(b"{\"cmd\":\"LIVE\""));
        assert!(frames[1].body.starts_with(b"{\"cmd\":\"DANMU_MSG\""));
    }
}

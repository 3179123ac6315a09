//! RFC 6455 server-side framing: handshake digest, frame decode (masked
//! client frames) and frame encode (unmasked server frames).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// Upper bound on a single (reassembled) frame payload.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validates an upgrade request (everything up to the blank line) and
/// builds the `101 Switching Protocols` response.
pub fn handshake_response(request: &[u8]) -> Result<String, String> {
    let text = std::str::from_utf8(request).map_err(|_| "handshake not utf-8".to_string())?;
    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or_default();
    if !start.starts_with("GET ") {
        return Err(format!("bad handshake start line: {start}"));
    }

    let mut upgrade_ok = false;
    let mut key = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade_ok = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_string());
        }
    }

    if !upgrade_ok {
        return Err("missing upgrade: websocket".to_string());
    }
    let key = key.ok_or_else(|| "missing sec-websocket-key".to_string())?;
    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    ))
}

pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Decodes one frame from the front of `data`. Returns the frame and the
/// number of bytes consumed, or `None` when more bytes are needed.
pub fn decode_frame(data: &[u8], require_mask: bool) -> Result<Option<(Frame, usize)>, String> {
    if data.len() < 2 {
        return Ok(None);
    }
    let b0 = data[0];
    if b0 & 0x70 != 0 {
        return Err("reserved frame bits set".to_string());
    }
    let fin = b0 & 0x80 != 0;
    let opcode = b0 & 0x0F;
    let b1 = data[1];
    let masked = b1 & 0x80 != 0;
    if require_mask && !masked {
        return Err("client frame without mask".to_string());
    }

    let mut offset = 2usize;
    let len = match b1 & 0x7F {
        126 => {
            if data.len() < offset + 2 {
                return Ok(None);
            }
            let v = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            offset += 2;
            v
        }
        127 => {
            if data.len() < offset + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[offset..offset + 8]);
            offset += 8;
            let v = u64::from_be_bytes(raw);
            if v > MAX_PAYLOAD as u64 {
                return Err(format!("frame payload too large: {v}"));
            }
            v as usize
        }
        v => v as usize,
    };
    if len > MAX_PAYLOAD {
        return Err(format!("frame payload too large: {len}"));
    }

    let mask_key = if masked {
        if data.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if data.len() < offset + len {
        return Ok(None);
    }
    let mut payload = data[offset..offset + len].to_vec();
    if let Some(key) = mask_key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }
    Ok(Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        offset + len,
    )))
}

/// Appends an unmasked server frame header.
pub fn encode_header(out: &mut Vec<u8>, fin: bool, opcode: u8, len: usize) {
    let b0 = if fin { 0x80 | opcode } else { opcode };
    out.push(b0);
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_requires_upgrade_and_key() {
        let req = b"GET /chat HTTP/1.1\r\nHost: example\r\nUpgrade: websocket\r\n\
            Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n";
        let resp = handshake_response(req).unwrap();
        assert!(resp.starts_with("HTTP/1.1 101"));
        assert!(resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        assert!(handshake_response(b"GET / HTTP/1.1\r\nHost: x\r\n").is_err());
        assert!(handshake_response(b"POST / HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn decodes_rfc_masked_hello() {
        let data = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (frame, consumed) = decode_frame(&data, true).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OP_TEXT);
        assert_eq!(frame.payload, b"Hello");
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn partial_frames_ask_for_more() {
        let data = [0x81, 0x85, 0x37, 0xfa];
        assert!(decode_frame(&data, true).unwrap().is_none());
    }

    #[test]
    fn unmasked_client_frame_is_refused() {
        let data = [0x81, 0x05, b'H', b'e', b'l', b'l', b'o'];
        assert!(decode_frame(&data, true).is_err());
        let (frame, _) = decode_frame(&data, false).unwrap().unwrap();
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn header_lengths_use_extended_forms() {
        let mut out = Vec::new();
        encode_header(&mut out, true, OP_BINARY, 5);
        assert_eq!(out, vec![0x82, 5]);

        out.clear();
        encode_header(&mut out, true, OP_TEXT, 300);
        assert_eq!(out[..2], [0x81, 126]);
        assert_eq!(u16::from_be_bytes([out[2], out[3]]), 300);

        out.clear();
        encode_header(&mut out, false, OP_TEXT, 70_000);
        assert_eq!(out[..2], [0x01, 127]);
    }
}

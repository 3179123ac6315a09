//! Compact UDP endpoint encoding.
//!
//! `'4' | ipv4 octets | port` or `'6' | ipv6 octets | port`, port in host
//! byte order. This string rides in front of every UDP read message and is
//! what services pass to `send_to`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Worst case: tag + 16 address bytes + port.
pub const MAX_ENCODED: usize = 1 + 16 + 2;

pub fn encode(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ENCODED);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(b'4');
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(b'6');
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_ne_bytes());
    out
}

/// Splits an encoded endpoint off the front of `data`, returning the
/// address and the remaining bytes.
pub fn decode(data: &[u8]) -> Option<(SocketAddr, &[u8])> {
    match data.first()? {
        b'4' => {
            if data.len() < 1 + 4 + 2 {
                return None;
            }
            let octets: [u8; 4] = data[1..5].try_into().ok()?;
            let port = u16::from_ne_bytes(data[5..7].try_into().ok()?);
            Some((
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port),
                &data[7..],
            ))
        }
        b'6' => {
            if data.len() < 1 + 16 + 2 {
                return None;
            }
            let octets: [u8; 16] = data[1..17].try_into().ok()?;
            let port = u16::from_ne_bytes(data[17..19].try_into().ok()?);
            Some((
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
                &data[19..],
            ))
        }
        _ => None,
    }
}

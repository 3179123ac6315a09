//! Typed message envelope routed between services.

use crate::buffer::{Buffer, BufferFlag};

/// Message type tags. Stable, part of the contract between services.
pub mod mtype {
    pub const UNKNOWN: u8 = 0;
    /// Internal notifications (service exit, shutdown bookkeeping).
    pub const SYSTEM: u8 = 1;
    /// Generic UTF-8 text reply.
    pub const TEXT: u8 = 2;
    /// Application-defined payload.
    pub const LUA: u8 = 3;
    /// New inbound connection announcement (sender = fd, payload = peer address).
    pub const SOCKET_ACCEPT: u8 = 4;
    /// Structured failure reply; session arrives sign-flipped.
    pub const ERROR: u8 = 5;
    /// Bytes received on a connection (sender = fd).
    pub const SOCKET_RECV: u8 = 6;
    /// A connection terminated (sender = fd).
    pub const SOCKET_CLOSE: u8 = 7;
    /// Fan-out to every service to begin teardown.
    pub const SHUTDOWN: u8 = 8;
    /// Timer expiry (sender = timer id, session = -timer id).
    pub const TIMER: u8 = 9;
    /// A socket operation failed (sender = fd, payload = reason).
    pub const SOCKET_ERROR: u8 = 10;
    /// UDP datagram (payload = encoded endpoint followed by the bytes).
    pub const SOCKET_UDP: u8 = 11;
    /// Integer reply, e.g. a freshly created service id or accepted fd.
    pub const INTEGER: u8 = 12;
    pub const DEBUG: u8 = 13;
}

/// Message payload: either an owned byte buffer or a bare integer.
#[derive(Debug, Default, Clone)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Buffer),
    Integer(i64),
}

/// The envelope delivered to [`Service::dispatch`](crate::service::Service).
///
/// `session` correlates a request with its reply; the runtime negates it on
/// every reply path so a caller can tell both sides apart by sign.
#[derive(Debug, Default)]
pub struct Message {
    pub mtype: u8,
    pub sender: u32,
    pub receiver: u32,
    pub session: i64,
    pub payload: Payload,
}

impl Message {
    pub fn with_empty(mtype: u8, sender: u32, receiver: u32, session: i64) -> Self {
        Self {
            mtype,
            sender,
            receiver,
            session,
            payload: Payload::Empty,
        }
    }

    pub fn with_bytes(mtype: u8, sender: u32, receiver: u32, session: i64, data: Buffer) -> Self {
        Self {
            mtype,
            sender,
            receiver,
            session,
            payload: Payload::Bytes(data),
        }
    }

    pub fn with_integer(mtype: u8, sender: u32, receiver: u32, session: i64, value: i64) -> Self {
        Self {
            mtype,
            sender,
            receiver,
            session,
            payload: Payload::Integer(value),
        }
    }

    pub fn with_text(mtype: u8, sender: u32, receiver: u32, session: i64, text: &str) -> Self {
        Self::with_bytes(mtype, sender, receiver, session, Buffer::from_slice(text.as_bytes()))
    }

    /// The payload bytes, empty for integer and empty payloads.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Bytes(b) => b.as_slice(),
            _ => &[],
        }
    }

    pub fn size(&self) -> usize {
        self.data().len()
    }

    pub fn as_integer(&self) -> i64 {
        match &self.payload {
            Payload::Integer(v) => *v,
            _ => 0,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match &self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_buffer_mut(&mut self) -> Option<&mut Buffer> {
        match &mut self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_buffer(self) -> Option<Buffer> {
        match self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn broadcast(&self) -> bool {
        matches!(&self.payload, Payload::Bytes(b) if b.has_flag(BufferFlag::Broadcast))
    }

    pub fn set_broadcast(&mut self) {
        if let Payload::Bytes(b) = &mut self.payload {
            b.set_flag(BufferFlag::Broadcast);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_accessors() {
        let m = Message::with_text(mtype::TEXT, 1, 2, 3, "ping");
        assert_eq!(m.data(), b"ping");
        assert_eq!(m.as_integer(), 0);

        let m = Message::with_integer(mtype::INTEGER, 0, 2, -3, 42);
        assert_eq!(m.as_integer(), 42);
        assert_eq!(m.size(), 0);
    }

    #[test]
    fn broadcast_rides_the_buffer_flag() {
        let mut m = Message::with_text(mtype::SYSTEM, 1, 0, 0, "x");
        assert!(!m.broadcast());
        m.set_broadcast();
        assert!(m.broadcast());
        // integer payloads cannot carry the flag
        let mut m = Message::with_integer(mtype::INTEGER, 0, 1, 0, 7);
        m.set_broadcast();
        assert!(!m.broadcast());
    }
}

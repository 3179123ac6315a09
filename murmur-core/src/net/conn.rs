//! Per-connection state and the reader/writer task pair.
//!
//! A connection is shared (Rc) between the worker-local socket tables and
//! its two tasks. Reads and writes are plain awaits, never raced against a
//! cancellation: `close` shuts the underlying socket down and the blocked
//! operation observes it through the kernel, so no completion is ever
//! dropped on the floor.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    os::fd::RawFd,
    rc::Rc,
};

use local_sync::mpsc::unbounded::{Rx, Tx};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};

use crate::{
    buffer::{Buffer, BufferFlag},
    log_error,
    message::{mtype, Message},
    worker::WorkerState,
};

use super::{ws, ReadOp, SocketProtocol};

pub(crate) const CHUNK_SEND: u8 = 1 << 0;
pub(crate) const CHUNK_RECV: u8 = 1 << 1;

/// Largest reassembled framed packet we will buffer.
const MAX_ASSEMBLED: usize = 16 * 1024 * 1024;
/// Largest tolerated websocket handshake request.
const MAX_HANDSHAKE: usize = 8 * 1024;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// How a connection ended; decides what the owner service hears about it.
enum Terminal {
    /// Application-initiated close: no notification.
    Silent,
    PeerClosed,
    Error(String),
}

pub(crate) struct Connection {
    pub fd: u32,
    pub owner: Cell<u32>,
    pub protocol: Cell<SocketProtocol>,
    pub role: Role,
    pub raw_fd: RawFd,
    pub address: String,
    pub recv_buf: RefCell<Buffer>,
    pub pending_read: RefCell<Option<(ReadOp, i64)>>,
    pub send_queue: RefCell<VecDeque<Buffer>>,
    pub pending_bytes: Cell<usize>,
    pub warn_size: Cell<usize>,
    pub error_size: Cell<usize>,
    pub chunked: Cell<u8>,
    pub timeout_secs: Cell<u64>,
    pub last_active: Cell<i64>,
    /// Teardown requested; reads and writes stop feeding the service.
    pub closing: Cell<bool>,
    /// Still present in the fd table and the server's watcher set.
    pub registered: Cell<bool>,
    finalized: Cell<bool>,
    ws_open: Cell<bool>,
    reader_tx: Tx<()>,
    writer_tx: Tx<()>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        fd: u32,
        owner: u32,
        protocol: SocketProtocol,
        role: Role,
        raw_fd: RawFd,
        address: String,
        reader_tx: Tx<()>,
        writer_tx: Tx<()>,
        now: i64,
    ) -> Self {
        Self {
            fd,
            owner: Cell::new(owner),
            protocol: Cell::new(protocol),
            role,
            raw_fd,
            address,
            recv_buf: RefCell::new(Buffer::with_capacity(READ_CHUNK)),
            pending_read: RefCell::new(None),
            send_queue: RefCell::new(VecDeque::new()),
            pending_bytes: Cell::new(0),
            warn_size: Cell::new(0),
            error_size: Cell::new(0),
            chunked: Cell::new(0),
            timeout_secs: Cell::new(0),
            last_active: Cell::new(now),
            closing: Cell::new(false),
            registered: Cell::new(true),
            finalized: Cell::new(false),
            ws_open: Cell::new(false),
            reader_tx,
            writer_tx,
        }
    }

    pub(crate) fn kick_reader(&self) {
        let _ = self.reader_tx.send(());
    }

    pub(crate) fn kick_writer(&self) {
        let _ = self.writer_tx.send(());
    }

    pub(crate) fn touch(&self, now: i64) {
        self.last_active.set(now);
    }

    /// Half-closes at the kernel so blocked reads and writes return, and
    /// wakes both tasks. Idempotent.
    pub(crate) fn initiate_close(&self) {
        if self.closing.replace(true) {
            return;
        }
        self.shutdown_raw();
        self.kick_reader();
        self.kick_writer();
    }

    fn shutdown_raw(&self) {
        let _ = nix::sys::socket::shutdown(self.raw_fd, nix::sys::socket::Shutdown::Both);
    }
}

/// Extracts a satisfied stream read request from the buffer.
pub(crate) fn try_take(buf: &mut Buffer, op: ReadOp) -> Option<Buffer> {
    let take = |buf: &mut Buffer, n: usize| {
        let mut out = Buffer::with_capacity(n);
        out.write_back(&buf.as_slice()[..n]);
        buf.consume(n);
        out
    };
    match op {
        ReadOp::Bytes(n) => {
            if n > 0 && buf.len() >= n {
                Some(take(buf, n))
            } else {
                None
            }
        }
        delim => {
            let pattern = delim.delimiter();
            find(buf.as_slice(), pattern).map(|pos| take(buf, pos + pattern.len()))
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Hands a socket message to the owner service on this worker; an absent
/// owner tears the connection down instead.
pub(crate) fn deliver(state: &Rc<WorkerState>, conn: &Rc<Connection>, msg: Message) {
    if !state.has_service(conn.owner.get()) {
        if conn.registered.replace(false) {
            state.sockets.remove_connection(conn.fd);
        }
        conn.initiate_close();
        return;
    }
    crate::worker::handle_message(state, msg);
}

/// Common teardown: deregister, resolve an in-flight read, tell the owner
/// what happened (unless the application asked for the close itself).
fn finalize(state: &Rc<WorkerState>, conn: &Rc<Connection>, terminal: Terminal) {
    if conn.finalized.replace(true) {
        return;
    }
    conn.closing.set(true);
    conn.kick_writer();
    if conn.registered.replace(false) {
        state.sockets.remove_connection(conn.fd);
    }

    let pending = conn.pending_read.borrow_mut().take();
    let session = pending.map(|(_, s)| -s).unwrap_or(0);
    let (owner, fd) = (conn.owner.get(), conn.fd);
    match terminal {
        Terminal::Silent => {}
        Terminal::PeerClosed => deliver(
            state,
            conn,
            Message::with_text(mtype::SOCKET_CLOSE, fd, owner, session, "closed"),
        ),
        Terminal::Error(reason) => deliver(
            state,
            conn,
            Message::with_text(mtype::SOCKET_ERROR, fd, owner, session, &reason),
        ),
    }
}

/// Drops the connection with an error notification to the owner. Used by
/// the send-queue overflow and idle-timeout paths.
pub(crate) fn fail_connection(state: &Rc<WorkerState>, conn: &Rc<Connection>, reason: &str) {
    finalize(state, conn, Terminal::Error(reason.to_string()));
    conn.initiate_close();
}

fn serve_pending_read(state: &Rc<WorkerState>, conn: &Rc<Connection>) -> bool {
    let pending = *conn.pending_read.borrow();
    let Some((op, session)) = pending else {
        return false;
    };
    let taken = try_take(&mut conn.recv_buf.borrow_mut(), op);
    match taken {
        Some(data) => {
            *conn.pending_read.borrow_mut() = None;
            let msg = Message::with_bytes(
                mtype::SOCKET_RECV,
                conn.fd,
                conn.owner.get(),
                -session,
                data,
            );
            deliver(state, conn, msg);
            true
        }
        None => false,
    }
}

/// Peels completed frames (reassembling chunked ones) off the receive
/// buffer. Returns true when at least one packet was delivered.
fn drain_framed(
    state: &Rc<WorkerState>,
    conn: &Rc<Connection>,
    acc: &mut Option<Buffer>,
) -> Result<bool, String> {
    let mut delivered = false;
    loop {
        let complete = {
            let mut rb = conn.recv_buf.borrow_mut();
            let chunked_recv = conn.chunked.get() & CHUNK_RECV != 0;
            let (more, size) = {
                let data = rb.as_slice();
                if data.len() < 2 {
                    break;
                }
                let word = u16::from_be_bytes([data[0], data[1]]);
                let (more, size) = if chunked_recv {
                    (word & 0x8000 != 0, (word & 0x7FFF) as usize)
                } else {
                    (false, word as usize)
                };
                if data.len() < 2 + size {
                    break;
                }
                (more, size)
            };
            {
                let body = &rb.as_slice()[2..2 + size];
                match acc.as_mut() {
                    Some(assembling) => {
                        if assembling.len() + size > MAX_ASSEMBLED {
                            return Err(format!("chunked packet exceeds {MAX_ASSEMBLED} bytes"));
                        }
                        assembling.write_back(body);
                    }
                    None => {
                        let mut b = Buffer::with_capacity(size.max(16));
                        b.write_back(body);
                        *acc = Some(b);
                    }
                }
            }
            rb.consume(2 + size);
            if more {
                None
            } else {
                acc.take()
            }
        };
        if let Some(packet) = complete {
            let msg = Message::with_bytes(
                mtype::SOCKET_RECV,
                conn.fd,
                conn.owner.get(),
                0,
                packet,
            );
            deliver(state, conn, msg);
            delivered = true;
        }
    }
    Ok(delivered)
}

enum WsProgress {
    Progress,
    NeedMore,
    PeerClose,
}

fn drain_ws(
    state: &Rc<WorkerState>,
    conn: &Rc<Connection>,
    acc: &mut Option<(u8, Vec<u8>)>,
) -> Result<WsProgress, String> {
    if !conn.ws_open.get() {
        // server side: the first read is the upgrade request
        let response = {
            let mut rb = conn.recv_buf.borrow_mut();
            let data = rb.as_slice();
            let Some(pos) = find(data, b"\r\n\r\n") else {
                if data.len() > MAX_HANDSHAKE {
                    return Err("websocket handshake too large".to_string());
                }
                return Ok(WsProgress::NeedMore);
            };
            let response = ws::handshake_response(&data[..pos + 4])?;
            rb.consume(pos + 4);
            response
        };
        let mut raw = Buffer::from_slice(response.as_bytes());
        raw.set_flag(BufferFlag::PackSize);
        conn.send_queue.borrow_mut().push_back(raw);
        conn.kick_writer();
        conn.ws_open.set(true);
        return Ok(WsProgress::Progress);
    }

    let mut delivered = false;
    loop {
        let parsed = {
            let rb = conn.recv_buf.borrow();
            ws::decode_frame(rb.as_slice(), conn.role == Role::Server)?
        };
        let Some((frame, consumed)) = parsed else {
            return Ok(if delivered {
                WsProgress::Progress
            } else {
                WsProgress::NeedMore
            });
        };
        conn.recv_buf.borrow_mut().consume(consumed);

        match frame.opcode {
            ws::OP_PING => {
                let mut pong = Buffer::from_slice(&frame.payload);
                pong.set_flag(BufferFlag::WsPong);
                conn.send_queue.borrow_mut().push_back(pong);
                conn.kick_writer();

                let mut data = Buffer::from_slice(&frame.payload);
                data.set_flag(BufferFlag::WsPing);
                let msg =
                    Message::with_bytes(mtype::SOCKET_RECV, conn.fd, conn.owner.get(), 0, data);
                deliver(state, conn, msg);
                delivered = true;
            }
            ws::OP_PONG => {
                let mut data = Buffer::from_slice(&frame.payload);
                data.set_flag(BufferFlag::WsPong);
                let msg =
                    Message::with_bytes(mtype::SOCKET_RECV, conn.fd, conn.owner.get(), 0, data);
                deliver(state, conn, msg);
                delivered = true;
            }
            ws::OP_CLOSE => {
                let mut reply = Buffer::new();
                let mut header = Vec::new();
                ws::encode_header(&mut header, true, ws::OP_CLOSE, 0);
                reply.write_back(&header);
                reply.set_flag(BufferFlag::PackSize);
                conn.send_queue.borrow_mut().push_back(reply);
                conn.kick_writer();
                return Ok(WsProgress::PeerClose);
            }
            ws::OP_TEXT | ws::OP_BINARY => {
                if frame.fin && acc.is_none() {
                    let text = frame.opcode == ws::OP_TEXT;
                    let mut data = Buffer::from_slice(&frame.payload);
                    if text {
                        data.set_flag(BufferFlag::WsText);
                    }
                    let msg = Message::with_bytes(
                        mtype::SOCKET_RECV,
                        conn.fd,
                        conn.owner.get(),
                        0,
                        data,
                    );
                    deliver(state, conn, msg);
                    delivered = true;
                } else if acc.is_none() {
                    *acc = Some((frame.opcode, frame.payload));
                } else {
                    return Err("fragment started inside another fragment".to_string());
                }
            }
            ws::OP_CONTINUATION => {
                let Some((opcode, mut payload)) = acc.take() else {
                    return Err("continuation without a started fragment".to_string());
                };
                if payload.len() + frame.payload.len() > ws::MAX_PAYLOAD {
                    return Err("fragmented message too large".to_string());
                }
                payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    let mut data = Buffer::from_slice(&payload);
                    if opcode == ws::OP_TEXT {
                        data.set_flag(BufferFlag::WsText);
                    }
                    let msg = Message::with_bytes(
                        mtype::SOCKET_RECV,
                        conn.fd,
                        conn.owner.get(),
                        0,
                        data,
                    );
                    deliver(state, conn, msg);
                    delivered = true;
                } else {
                    *acc = Some((opcode, payload));
                }
            }
            other => return Err(format!("unsupported websocket opcode {other:#x}")),
        }
    }
}

pub(crate) async fn reader_task<R: AsyncReadRent>(
    state: Rc<WorkerState>,
    conn: Rc<Connection>,
    mut rh: R,
    mut rx: Rx<()>,
) {
    let mut chunk: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut framed_acc: Option<Buffer> = None;
    let mut ws_acc: Option<(u8, Vec<u8>)> = None;

    let terminal = loop {
        if conn.closing.get() {
            break Terminal::Silent;
        }

        match conn.protocol.get() {
            SocketProtocol::Stream => {
                if serve_pending_read(&state, &conn) {
                    continue;
                }
                if conn.pending_read.borrow().is_none() {
                    // nothing outstanding: park until a read request,
                    // protocol switch or close arrives
                    match rx.recv().await {
                        Some(()) => continue,
                        None => break Terminal::Silent,
                    }
                }
            }
            SocketProtocol::Framed => match drain_framed(&state, &conn, &mut framed_acc) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(reason) => break Terminal::Error(reason),
            },
            SocketProtocol::Ws => match drain_ws(&state, &conn, &mut ws_acc) {
                Ok(WsProgress::Progress) => continue,
                Ok(WsProgress::NeedMore) => {}
                Ok(WsProgress::PeerClose) => break Terminal::PeerClosed,
                Err(reason) => break Terminal::Error(reason),
            },
        }

        if chunk.capacity() == 0 {
            chunk = Vec::with_capacity(READ_CHUNK);
        }
        let (res, buf) = rh.read(chunk).await;
        chunk = buf;
        match res {
            Ok(0) => {
                if conn.closing.get() {
                    break Terminal::Silent;
                }
                break Terminal::PeerClosed;
            }
            Ok(_) => {
                conn.recv_buf.borrow_mut().write_back(&chunk);
                conn.touch(state.server.now());
            }
            Err(e) => {
                if conn.closing.get() {
                    break Terminal::Silent;
                }
                break Terminal::Error(e.to_string());
            }
        }
    };
    finalize(&state, &conn, terminal);
}

/// Applies the connection's protocol to one queued buffer.
fn encode_frame(conn: &Connection, buf: &Buffer, out: &mut Vec<u8>) -> Result<(), String> {
    let data = buf.as_slice();
    if buf.has_flag(BufferFlag::PackSize) {
        // prebuilt bytes (handshake responses, control frames)
        out.extend_from_slice(data);
        return Ok(());
    }
    match conn.protocol.get() {
        SocketProtocol::Stream => out.extend_from_slice(data),
        SocketProtocol::Framed => {
            if conn.chunked.get() & CHUNK_SEND != 0 {
                let mut rest = data;
                while rest.len() > 0x7FFF {
                    out.extend_from_slice(&(0x8000u16 | 0x7FFF).to_be_bytes());
                    out.extend_from_slice(&rest[..0x7FFF]);
                    rest = &rest[0x7FFF..];
                }
                out.extend_from_slice(&(rest.len() as u16).to_be_bytes());
                out.extend_from_slice(rest);
            } else {
                if data.len() > u16::MAX as usize {
                    return Err(format!("send data too long: {} bytes", data.len()));
                }
                out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                out.extend_from_slice(data);
            }
        }
        SocketProtocol::Ws => {
            let opcode = if buf.has_flag(BufferFlag::WsPing) {
                ws::OP_PING
            } else if buf.has_flag(BufferFlag::WsPong) {
                ws::OP_PONG
            } else if buf.has_flag(BufferFlag::WsText) {
                ws::OP_TEXT
            } else {
                ws::OP_BINARY
            };
            ws::encode_header(out, true, opcode, data.len());
            out.extend_from_slice(data);
        }
    }
    Ok(())
}

pub(crate) async fn writer_task<W: AsyncWriteRent>(
    state: Rc<WorkerState>,
    conn: Rc<Connection>,
    mut wh: W,
    mut rx: Rx<()>,
) {
    let mut out: Vec<u8> = Vec::new();
    loop {
        let next = conn.send_queue.borrow_mut().pop_front();
        let Some(buf) = next else {
            if conn.closing.get() {
                break;
            }
            match rx.recv().await {
                Some(()) => continue,
                None => break,
            }
        };

        let close_after = buf.has_flag(BufferFlag::Close);
        let accounted = buf.len();
        out.clear();
        if let Err(reason) = encode_frame(&conn, &buf, &mut out) {
            log_error!("socket [{}] {}", conn.fd, reason);
            fail_connection(&state, &conn, &reason);
            return;
        }
        if !out.is_empty() {
            let (res, b) = wh.write_all(std::mem::take(&mut out)).await;
            out = b;
            conn.pending_bytes
                .set(conn.pending_bytes.get().saturating_sub(accounted));
            match res {
                Ok(_) => conn.touch(state.server.now()),
                Err(e) => {
                    if !conn.closing.get() {
                        finalize(&state, &conn, Terminal::Error(e.to_string()));
                    }
                    conn.initiate_close();
                    return;
                }
            }
        }
        if close_after {
            // flush-then-close requested by the sender
            finalize(&state, &conn, Terminal::Silent);
            conn.initiate_close();
            return;
        }
    }
    let _ = wh.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_exact_byte_counts() {
        let mut buf = Buffer::from_slice(b"abcdef");
        assert!(try_take(&mut buf, ReadOp::Bytes(10)).is_none());
        let got = try_take(&mut buf, ReadOp::Bytes(4)).unwrap();
        assert_eq!(got.as_slice(), b"abcd");
        assert_eq!(buf.as_slice(), b"ef");
    }

    #[test]
    fn take_up_to_and_including_delimiter() {
        let mut buf = Buffer::from_slice(b"GET / HTTP/1.1\r\n\r\nbody");
        let got = try_take(&mut buf, ReadOp::Header).unwrap();
        assert_eq!(got.as_slice(), b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(buf.as_slice(), b"body");

        let mut buf = Buffer::from_slice(b"no delimiter here");
        assert!(try_take(&mut buf, ReadOp::Line).is_none());
    }
}

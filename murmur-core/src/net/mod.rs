//! Per-worker socket subsystem.
//!
//! Every worker hosts one [`SocketServer`] with three tables keyed by the
//! process-wide fd handle: TCP acceptors, TCP connections and UDP
//! endpoints. A socket belongs to the worker that created it; the only
//! cross-worker movement is the accept handoff, where the connection is
//! built on the owning service's worker from a duplicated listener.

pub mod endpoint;
mod conn;
mod ws;

use std::{
    cell::RefCell,
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    rc::Rc,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use local_sync::mpsc::unbounded::{channel, Rx, Tx};
use monoio::net::{TcpListener, TcpStream};
use nix::sys::socket::{
    bind as nix_bind, listen as nix_listen, setsockopt, socket as nix_socket, sockopt,
    AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6,
};

use crate::{
    buffer::Buffer,
    log_error, log_warn,
    message::{mtype, Message},
    server::Server,
    worker::WorkerState,
    worker_id, AnyResult,
};

pub(crate) use conn::{fail_connection, try_take, Connection, Role, CHUNK_RECV, CHUNK_SEND};

/// Connection protocol variants: raw stream, length-prefix framed,
/// websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    Stream,
    Framed,
    Ws,
}

#[derive(thiserror::Error, Debug)]
#[error("unknown socket protocol {0:?}, expected tcp, framed or ws")]
pub struct ParseProtocolError(String);

impl FromStr for SocketProtocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(SocketProtocol::Stream),
            "framed" => Ok(SocketProtocol::Framed),
            "ws" => Ok(SocketProtocol::Ws),
            other => Err(ParseProtocolError(other.to_string())),
        }
    }
}

/// What a stream read waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOp {
    /// Exactly this many bytes.
    Bytes(usize),
    /// Up to and including `\n`.
    Line,
    /// Up to and including `\r\n`.
    CrLf,
    /// Up to and including `\r\n\r\n`.
    Header,
}

impl ReadOp {
    /// `delim` empty selects a byte-count read, otherwise one of the three
    /// supported delimiters.
    pub fn parse(n: usize, delim: &str) -> Option<Self> {
        match delim {
            "" => (n > 0).then_some(ReadOp::Bytes(n)),
            "\n" => Some(ReadOp::Line),
            "\r\n" => Some(ReadOp::CrLf),
            "\r\n\r\n" => Some(ReadOp::Header),
            _ => None,
        }
    }

    pub(crate) fn delimiter(self) -> &'static [u8] {
        match self {
            ReadOp::Bytes(_) => &[],
            ReadOp::Line => b"\n",
            ReadOp::CrLf => b"\r\n",
            ReadOp::Header => b"\r\n\r\n",
        }
    }
}

/// Immediate outcome of a read request.
pub enum ReadStart {
    /// Satisfied from buffered bytes, no message will follow.
    Direct(Buffer),
    /// Recorded; a SOCKET_RECV (or SOCKET_CLOSE) resolves it later.
    Pending,
    Closed(String),
}

struct Acceptor {
    fd: u32,
    owner: u32,
    protocol: SocketProtocol,
    listener: std::net::TcpListener,
    req_tx: Tx<(i64, u32)>,
    closed: Arc<AtomicBool>,
}

/// Cross-worker accept handoff payload: a duplicated listener handle plus
/// everything needed to attach and answer on the owner's worker.
pub struct RemoteAccept {
    pub(crate) listener: std::net::TcpListener,
    pub(crate) acceptor_fd: u32,
    pub(crate) caller: u32,
    pub(crate) owner: u32,
    pub(crate) protocol: SocketProtocol,
    pub(crate) session: i64,
    pub(crate) closed: Arc<AtomicBool>,
}

struct UdpEndpoint {
    fd: u32,
    owner: u32,
    socket: Rc<monoio::net::udp::UdpSocket>,
    peer: RefCell<Option<SocketAddr>>,
    close_tx: Tx<()>,
}

pub struct SocketServer {
    server: Arc<Server>,
    worker_id: u32,
    acceptors: RefCell<HashMap<u32, Rc<Acceptor>>>,
    connections: RefCell<HashMap<u32, Rc<Connection>>>,
    udp: RefCell<HashMap<u32, Rc<UdpEndpoint>>>,
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Binds a listening socket with `SO_REUSEADDR`, the way a restart-friendly
/// server must.
fn bind_listener(host: &str, port: u16) -> AnyResult<std::net::TcpListener> {
    let addr = resolve(host, port)
        .ok_or_else(|| anyhow::anyhow!("resolve {host}:{port} failed"))?;
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let sock: OwnedFd = nix_socket(family, SockType::Stream, SockFlag::empty(), None)?;
    setsockopt(&sock, sockopt::ReuseAddr, &true)?;
    match addr {
        SocketAddr::V4(v4) => nix_bind(sock.as_raw_fd(), &SockaddrIn::from(v4))?,
        SocketAddr::V6(v6) => nix_bind(sock.as_raw_fd(), &SockaddrIn6::from(v6))?,
    }
    nix_listen(&sock, Backlog::MAXCONN)?;
    Ok(std::net::TcpListener::from(sock))
}

/// Synchronous bind/connect probe, a diagnostic for "is this address
/// usable before I commit to it".
pub fn try_open(host: &str, port: u16, is_connect: bool) -> bool {
    if is_connect {
        match resolve(host, port) {
            Some(addr) => match std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(5))
            {
                Ok(_) => true,
                Err(e) => {
                    log_error!("try_open {}:{} {}", host, port, e);
                    false
                }
            },
            None => false,
        }
    } else {
        match bind_listener(host, port) {
            Ok(_) => true,
            Err(e) => {
                log_error!("try_open {}:{} {}", host, port, e);
                false
            }
        }
    }
}

fn into_monoio_listener(listener: std::net::TcpListener) -> std::io::Result<TcpListener> {
    if monoio::utils::is_legacy() {
        listener.set_nonblocking(true)?;
    }
    TcpListener::from_std(listener)
}

impl SocketServer {
    pub(crate) fn new(server: Arc<Server>, worker_id: u32) -> Self {
        Self {
            server,
            worker_id,
            acceptors: RefCell::new(HashMap::new()),
            connections: RefCell::new(HashMap::new()),
            udp: RefCell::new(HashMap::new()),
        }
    }

    /// Arms the idle sweep: every 10 s, connections quiet past their
    /// per-connection timeout are dropped with a SOCKET_ERROR.
    pub(crate) fn start(&self, state: &Rc<WorkerState>) {
        let state = state.clone();
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(Duration::from_secs(10)).await;
                let now = state.server.now();
                let expired: Vec<Rc<Connection>> = state
                    .sockets
                    .connections
                    .borrow()
                    .values()
                    .filter(|c| {
                        let t = c.timeout_secs.get();
                        t > 0 && now - c.last_active.get() > t as i64 * 1000
                    })
                    .cloned()
                    .collect();
                for conn in expired {
                    fail_connection(&state, &conn, "read timeout");
                }
            }
        });
    }

    /// Opens an acceptor on this worker. The accept pump task owns the
    /// monoio listener; requests are queued to it.
    pub(crate) fn listen(
        &self,
        state: &Rc<WorkerState>,
        host: &str,
        port: u16,
        owner: u32,
        protocol: SocketProtocol,
    ) -> AnyResult<(u32, SocketAddr)> {
        let listener = bind_listener(host, port)?;
        let local = listener.local_addr()?;
        let pump_listener = into_monoio_listener(listener.try_clone()?)?;

        let fd = self.server.next_fd();
        let (req_tx, req_rx) = channel();
        let acceptor = Rc::new(Acceptor {
            fd,
            owner,
            protocol,
            listener,
            req_tx,
            closed: Arc::new(AtomicBool::new(false)),
        });
        self.acceptors.borrow_mut().insert(fd, acceptor.clone());
        monoio::spawn(accept_pump(state.clone(), acceptor, pump_listener, req_rx));
        Ok((fd, local))
    }

    /// Queues an accept. `session != 0` is a one-shot resolved with an
    /// INTEGER fd reply; `session == 0` switches to continuous mode where
    /// every connection is announced via SOCKET_ACCEPT. An owner pinned to
    /// another worker gets the connection built over there.
    pub(crate) fn accept(&self, fd: u32, session: i64, owner: u32) -> bool {
        let Some(acceptor) = self.acceptors.borrow().get(&fd).cloned() else {
            return false;
        };
        if acceptor.closed.load(Ordering::Acquire) {
            return false;
        }
        if worker_id(owner) != self.worker_id {
            let Some(worker) = self.server.get_worker(0, owner) else {
                return false;
            };
            let Ok(listener) = acceptor.listener.try_clone() else {
                return false;
            };
            worker.accept_on(RemoteAccept {
                listener,
                acceptor_fd: acceptor.fd,
                caller: acceptor.owner,
                owner,
                protocol: acceptor.protocol,
                session,
                closed: acceptor.closed.clone(),
            });
            return true;
        }
        acceptor.req_tx.send((session, owner)).is_ok()
    }

    /// Outbound connection on the caller's worker; resolves `session` with
    /// INTEGER fd or ERROR. Websocket framing is server-side only.
    pub(crate) fn connect(
        &self,
        state: &Rc<WorkerState>,
        host: String,
        port: u16,
        owner: u32,
        protocol: SocketProtocol,
        session: i64,
        timeout_ms: u32,
    ) {
        if protocol == SocketProtocol::Ws {
            self.server.response(
                owner,
                &format!("connect {host}:{port} websocket client not supported"),
                session,
                mtype::ERROR,
            );
            return;
        }
        let state = state.clone();
        monoio::spawn(async move {
            let server = state.server.clone();
            let Some(addr) = resolve(&host, port) else {
                server.response(
                    owner,
                    &format!("resolve {host}:{port} failed"),
                    session,
                    mtype::ERROR,
                );
                return;
            };
            let connected = if timeout_ms > 0 {
                match monoio::time::timeout(
                    Duration::from_millis(timeout_ms as u64),
                    TcpStream::connect(addr),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => {
                        server.response(
                            owner,
                            &format!("connect {host}:{port} timeout"),
                            session,
                            mtype::ERROR,
                        );
                        return;
                    }
                }
            } else {
                TcpStream::connect(addr).await
            };
            match connected {
                Ok(stream) => {
                    let fd = attach(&state, stream, addr, protocol, owner, Role::Client);
                    server.send_message(Message::with_integer(
                        mtype::INTEGER,
                        fd,
                        owner,
                        -session,
                        fd as i64,
                    ));
                }
                Err(e) => server.response(
                    owner,
                    &format!("connect {host}:{port} {e}"),
                    session,
                    mtype::ERROR,
                ),
            }
        });
    }

    /// Stream read request: direct result when the buffered bytes already
    /// satisfy it, otherwise recorded as the single outstanding read.
    pub(crate) fn read(&self, fd: u32, owner: u32, op: ReadOp, session: i64) -> ReadStart {
        let Some(conn) = self.connections.borrow().get(&fd).cloned() else {
            return ReadStart::Closed("socket.read: closed".to_string());
        };
        if conn.owner.get() != owner {
            return ReadStart::Closed("socket.read: not the owner".to_string());
        }
        if conn.protocol.get() != SocketProtocol::Stream {
            return ReadStart::Closed(
                "socket.read: framed protocols deliver automatically".to_string(),
            );
        }
        if conn.closing.get() {
            return ReadStart::Closed("socket.read: closed".to_string());
        }
        if conn.pending_read.borrow().is_some() {
            return ReadStart::Closed("socket.read: read in progress".to_string());
        }
        if let Some(data) = try_take(&mut conn.recv_buf.borrow_mut(), op) {
            return ReadStart::Direct(data);
        }
        *conn.pending_read.borrow_mut() = Some((op, session));
        conn.kick_reader();
        ReadStart::Pending
    }

    /// Enqueues bytes on a connection (or a connected UDP endpoint) and
    /// kicks the writer. Enforces the send-queue thresholds.
    pub(crate) fn write(
        &self,
        state: &Rc<WorkerState>,
        fd: u32,
        mut data: Buffer,
        mask: u8,
    ) -> bool {
        if data.is_empty() {
            return false;
        }
        let found = self.connections.borrow().get(&fd).cloned();
        if let Some(conn) = found {
            if conn.closing.get() || !conn.registered.get() {
                return false;
            }
            data.set_flags(mask);
            let len = data.len();
            let before = conn.pending_bytes.get();
            let pending = before + len;
            let error_size = conn.error_size.get();
            if error_size > 0 && pending > error_size {
                fail_connection(
                    state,
                    &conn,
                    &format!("send queue overflow: {pending} pending bytes"),
                );
                return false;
            }
            let warn_size = conn.warn_size.get();
            if warn_size > 0 && before <= warn_size && pending > warn_size {
                log_warn!(
                    "socket [{}] send queue reached {} pending bytes",
                    fd,
                    pending
                );
            }
            conn.pending_bytes.set(pending);
            conn.send_queue.borrow_mut().push_back(data);
            conn.kick_writer();
            return true;
        }

        let found = self.udp.borrow().get(&fd).cloned();
        if let Some(udp) = found {
            let Some(peer) = *udp.peer.borrow() else {
                return false;
            };
            let payload = data.as_slice().to_vec();
            let sock = udp.socket.clone();
            monoio::spawn(async move {
                let _ = sock.send_to(payload, peer).await;
            });
            return true;
        }
        false
    }

    /// Closes any fd kind: removes it from this worker's table and the
    /// server's watcher set. Application closes are silent, but an
    /// in-flight read resolves with SOCKET_CLOSE.
    pub(crate) fn close(&self, state: &Rc<WorkerState>, fd: u32) -> bool {
        let removed = self.connections.borrow_mut().remove(&fd);
        if let Some(conn) = removed {
            conn.registered.set(false);
            self.server.unlock_fd(fd);
            let pending = conn.pending_read.borrow_mut().take();
            if let Some((_, session)) = pending {
                conn::deliver(
                    state,
                    &conn,
                    Message::with_text(
                        mtype::SOCKET_CLOSE,
                        fd,
                        conn.owner.get(),
                        -session,
                        "closed",
                    ),
                );
            }
            conn.initiate_close();
            return true;
        }

        let removed = self.udp.borrow_mut().remove(&fd);
        if let Some(udp) = removed {
            self.server.unlock_fd(fd);
            let _ = udp.close_tx.send(());
            return true;
        }

        let removed = self.acceptors.borrow_mut().remove(&fd);
        if let Some(acceptor) = removed {
            self.server.unlock_fd(fd);
            acceptor.closed.store(true, Ordering::Release);
            // unblocks any pump parked in accept, including remote ones
            // sharing the duplicated description
            let _ = nix::sys::socket::shutdown(
                acceptor.listener.as_raw_fd(),
                nix::sys::socket::Shutdown::Both,
            );
            return true;
        }
        false
    }

    pub(crate) fn close_all(&self) {
        for (fd, conn) in self.connections.borrow_mut().drain() {
            if conn.registered.replace(false) {
                self.server.unlock_fd(fd);
            }
            conn.initiate_close();
        }
        for (fd, udp) in self.udp.borrow_mut().drain() {
            self.server.unlock_fd(fd);
            let _ = udp.close_tx.send(());
        }
        for (fd, acceptor) in self.acceptors.borrow_mut().drain() {
            self.server.unlock_fd(fd);
            acceptor.closed.store(true, Ordering::Release);
            let _ = nix::sys::socket::shutdown(
                acceptor.listener.as_raw_fd(),
                nix::sys::socket::Shutdown::Both,
            );
        }
    }

    /// Table removal driven by a connection task observing EOF or an
    /// error.
    pub(crate) fn remove_connection(&self, fd: u32) {
        if self.connections.borrow_mut().remove(&fd).is_some() {
            self.server.unlock_fd(fd);
        }
    }

    pub(crate) fn settimeout(&self, fd: u32, seconds: u64) -> bool {
        match self.connections.borrow().get(&fd) {
            Some(conn) => {
                conn.timeout_secs.set(seconds);
                true
            }
            None => false,
        }
    }

    pub(crate) fn setnodelay(&self, fd: u32) -> bool {
        match self.connections.borrow().get(&fd) {
            Some(conn) => {
                let borrowed = unsafe { BorrowedFd::borrow_raw(conn.raw_fd) };
                setsockopt(&borrowed, sockopt::TcpNoDelay, &true).is_ok()
            }
            None => false,
        }
    }

    /// 'r' enables chunked receive reassembly, 'w' chunked sends.
    pub(crate) fn set_enable_chunked(&self, fd: u32, flag: &str) -> bool {
        let mut mask = 0u8;
        for c in flag.chars() {
            match c {
                'r' | 'R' => mask |= CHUNK_RECV,
                'w' | 'W' => mask |= CHUNK_SEND,
                _ => {
                    log_warn!(
                        "set_enable_chunked: unsupported flag {:?}, expected 'r' and/or 'w'",
                        flag
                    );
                    return false;
                }
            }
        }
        match self.connections.borrow().get(&fd) {
            Some(conn) if conn.protocol.get() == SocketProtocol::Framed => {
                conn.chunked.set(mask);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_send_queue_limit(&self, fd: u32, warn: usize, error: usize) -> bool {
        match self.connections.borrow().get(&fd) {
            Some(conn) => {
                conn.warn_size.set(warn);
                conn.error_size.set(error);
                true
            }
            None => false,
        }
    }

    pub(crate) fn getaddress(&self, fd: u32) -> String {
        self.connections
            .borrow()
            .get(&fd)
            .map(|c| c.address.clone())
            .unwrap_or_default()
    }

    /// Re-tags a raw stream as framed or websocket. Only valid before the
    /// new protocol's traffic starts.
    pub(crate) fn switch_type(&self, fd: u32, protocol: SocketProtocol) -> bool {
        match self.connections.borrow().get(&fd) {
            Some(conn)
                if conn.protocol.get() == SocketProtocol::Stream
                    && conn.pending_read.borrow().is_none() =>
            {
                conn.protocol.set(protocol);
                conn.kick_reader();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn udp_open(
        &self,
        state: &Rc<WorkerState>,
        owner: u32,
        host: Option<&str>,
        port: u16,
    ) -> AnyResult<(u32, SocketAddr)> {
        let addr = match host {
            Some(h) => resolve(h, port)
                .ok_or_else(|| anyhow::anyhow!("resolve {h}:{port} failed"))?,
            None => SocketAddr::from(([0, 0, 0, 0], 0)),
        };
        let socket = Rc::new(monoio::net::udp::UdpSocket::bind(addr)?);
        let local = socket.local_addr()?;
        let fd = self.server.next_fd();
        let (close_tx, close_rx) = channel();
        let udp = Rc::new(UdpEndpoint {
            fd,
            owner,
            socket,
            peer: RefCell::new(None),
            close_tx,
        });
        self.udp.borrow_mut().insert(fd, udp.clone());
        monoio::spawn(udp_pump(state.clone(), udp, close_rx));
        Ok((fd, local))
    }

    /// Sets the default peer used by `write` on this endpoint.
    pub(crate) fn udp_connect(&self, fd: u32, host: &str, port: u16) -> bool {
        let Some(udp) = self.udp.borrow().get(&fd).cloned() else {
            return false;
        };
        match resolve(host, port) {
            Some(addr) => {
                *udp.peer.borrow_mut() = Some(addr);
                true
            }
            None => false,
        }
    }

    /// Datagram to an encoded endpoint (see [`endpoint`]).
    pub(crate) fn send_to(&self, fd: u32, address: &[u8], data: Buffer) -> bool {
        if data.is_empty() {
            return false;
        }
        let Some(udp) = self.udp.borrow().get(&fd).cloned() else {
            return false;
        };
        let Some((addr, _)) = endpoint::decode(address) else {
            return false;
        };
        let payload = data.as_slice().to_vec();
        let sock = udp.socket.clone();
        monoio::spawn(async move {
            let _ = sock.send_to(payload, addr).await;
        });
        true
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.acceptors.borrow().len(),
            self.connections.borrow().len(),
            self.udp.borrow().len(),
        )
    }
}

/// Builds the connection on this worker and spawns its task pair.
fn attach(
    state: &Rc<WorkerState>,
    stream: TcpStream,
    peer: SocketAddr,
    protocol: SocketProtocol,
    owner: u32,
    role: Role,
) -> u32 {
    let raw_fd = stream.as_raw_fd();
    let fd = state.server.next_fd();
    let (reader_tx, reader_rx) = channel();
    let (writer_tx, writer_rx) = channel();
    let conn = Rc::new(Connection::new(
        fd,
        owner,
        protocol,
        role,
        raw_fd,
        peer.to_string(),
        reader_tx,
        writer_tx,
        state.server.now(),
    ));
    state.sockets.connections.borrow_mut().insert(fd, conn.clone());

    use monoio::io::Splitable;
    let (read_half, write_half) = stream.into_split();
    monoio::spawn(conn::reader_task(
        state.clone(),
        conn.clone(),
        read_half,
        reader_rx,
    ));
    monoio::spawn(conn::writer_task(
        state.clone(),
        conn.clone(),
        write_half,
        writer_rx,
    ));

    if role == Role::Server {
        conn::deliver(
            state,
            &conn,
            Message::with_text(mtype::SOCKET_ACCEPT, fd, owner, 0, &conn.address),
        );
    }
    fd
}

async fn accept_pump(
    state: Rc<WorkerState>,
    acceptor: Rc<Acceptor>,
    listener: TcpListener,
    mut req_rx: Rx<(i64, u32)>,
) {
    while let Some((session, owner)) = req_rx.recv().await {
        if acceptor.closed.load(Ordering::Acquire) {
            break;
        }
        if session == 0 {
            // continuous mode: announce every connection to the owner
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if acceptor.closed.load(Ordering::Acquire) {
                            break;
                        }
                        attach(&state, stream, peer, acceptor.protocol, owner, Role::Server);
                    }
                    Err(e) => {
                        if acceptor.closed.load(Ordering::Acquire) {
                            break;
                        }
                        log_error!("accept on [{}] failed: {}", acceptor.fd, e);
                        monoio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            break;
        }
        match listener.accept().await {
            Ok((stream, peer)) => {
                if acceptor.closed.load(Ordering::Acquire) {
                    break;
                }
                let fd = attach(&state, stream, peer, acceptor.protocol, owner, Role::Server);
                state.server.send_message(Message::with_integer(
                    mtype::INTEGER,
                    acceptor.fd,
                    acceptor.owner,
                    -session,
                    fd as i64,
                ));
            }
            Err(e) => {
                if acceptor.closed.load(Ordering::Acquire) {
                    break;
                }
                state.server.response(
                    acceptor.owner,
                    &format!("accept on [{}] {e}", acceptor.fd),
                    session,
                    mtype::ERROR,
                );
            }
        }
    }
}

/// Owner-side half of the accept handoff (see
/// [`SocketServer::accept`]). Runs on the owner's worker.
pub(crate) fn accept_remote(state: &Rc<WorkerState>, req: RemoteAccept) {
    let state = state.clone();
    monoio::spawn(async move {
        let listener = match into_monoio_listener(req.listener) {
            Ok(l) => l,
            Err(e) => {
                if req.session != 0 {
                    state.server.response(
                        req.caller,
                        &format!("accept on [{}] {e}", req.acceptor_fd),
                        req.session,
                        mtype::ERROR,
                    );
                }
                return;
            }
        };
        loop {
            if req.closed.load(Ordering::Acquire) {
                break;
            }
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if req.closed.load(Ordering::Acquire) {
                        break;
                    }
                    let fd = attach(&state, stream, peer, req.protocol, req.owner, Role::Server);
                    if req.session != 0 {
                        state.server.send_message(Message::with_integer(
                            mtype::INTEGER,
                            req.acceptor_fd,
                            req.caller,
                            -req.session,
                            fd as i64,
                        ));
                        break;
                    }
                }
                Err(e) => {
                    if !req.closed.load(Ordering::Acquire) && req.session != 0 {
                        state.server.response(
                            req.caller,
                            &format!("accept on [{}] {e}", req.acceptor_fd),
                            req.session,
                            mtype::ERROR,
                        );
                    }
                    break;
                }
            }
        }
    });
}

async fn udp_pump(state: Rc<WorkerState>, udp: Rc<UdpEndpoint>, mut close_rx: Rx<()>) {
    let mut chunk: Vec<u8> = Vec::with_capacity(2048);
    loop {
        if chunk.capacity() == 0 {
            chunk = Vec::with_capacity(2048);
        }
        let received = monoio::select! {
            _ = close_rx.recv() => None,
            r = udp.socket.recv_from(std::mem::take(&mut chunk)) => Some(r),
        };
        let Some((res, buf)) = received else {
            break;
        };
        chunk = buf;
        match res {
            Ok((n, peer)) => {
                if n == 0 {
                    continue;
                }
                let mut data = Buffer::with_head_reserve(n, endpoint::MAX_ENCODED);
                data.write_back(&chunk[..n]);
                let ok = data.write_front(&endpoint::encode(&peer));
                debug_assert!(ok);
                let msg =
                    Message::with_bytes(mtype::SOCKET_UDP, udp.fd, udp.owner, 0, data);
                if state.has_service(udp.owner) {
                    crate::worker::handle_message(&state, msg);
                } else {
                    // owner is gone; tear the endpoint down
                    let sockets = &state.sockets;
                    if sockets.udp.borrow_mut().remove(&udp.fd).is_some() {
                        state.server.unlock_fd(udp.fd);
                    }
                    break;
                }
            }
            Err(e) => {
                log_error!("udp [{}] recv failed: {}", udp.fd, e);
                monoio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

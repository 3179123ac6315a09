//! The runtime surface handed to a running service.
//!
//! Every [`Service`](crate::service::Service) callback receives a
//! [`ServiceContext`]. Calls that cannot complete synchronously return a
//! positive session token; the completion arrives later as a message whose
//! session is the negated token. A service replying to a request passes the
//! (negative) session it received back into [`send`](ServiceContext::send),
//! which negates again so the caller resolves on its positive token.

use std::{net::SocketAddr, rc::Rc, sync::Arc};

use crate::{
    buffer::Buffer,
    log,
    message::Message,
    net::{endpoint, ReadOp, ReadStart, SocketProtocol},
    server::{Server, State},
    service::{MemoryMeter, ServiceConf, ServiceMeta},
    worker::WorkerState,
    log::LogLevel,
};

/// Outcome of a [`read`](ServiceContext::read) request.
#[derive(Debug)]
pub enum ReadResult {
    /// The request was satisfiable from already-buffered bytes.
    Data(Buffer),
    /// The request is outstanding; a SOCKET_RECV with the negated session
    /// will follow.
    Pending(i64),
    Failed(String),
}

pub struct ServiceContext {
    state: Rc<WorkerState>,
    meta: Rc<ServiceMeta>,
}

impl ServiceContext {
    pub(crate) fn new(state: Rc<WorkerState>, meta: Rc<ServiceMeta>) -> Self {
        Self { state, meta }
    }

    pub fn id(&self) -> u32 {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn unique(&self) -> bool {
        self.meta.unique
    }

    pub fn worker_id(&self) -> u32 {
        self.state.id()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.state.server
    }

    /// Memory accounting for this service; allocation-heavy services charge
    /// their payloads here and treat a refusal as a soft failure.
    pub fn mem(&self) -> &MemoryMeter {
        &self.meta.mem
    }

    /// Positive, never-reused correlation token.
    pub fn next_sequence(&self) -> i64 {
        self.meta.next_sequence()
    }

    /// Last signal value forwarded to this worker, 0 when none. Long
    /// handlers poll this to honor interrupts.
    pub fn take_signal(&self) -> i32 {
        self.state.take_signal()
    }

    // ---- messaging ----------------------------------------------------

    /// Sends `data` to `receiver`. The receiver observes the negated
    /// session; pass 0 for fire-and-forget.
    pub fn send(&self, receiver: u32, mtype: u8, data: Buffer, session: i64) -> i64 {
        self.state
            .server
            .send(self.meta.id, receiver, data, session, mtype);
        session
    }

    pub fn send_text(&self, receiver: u32, mtype: u8, text: &str, session: i64) -> i64 {
        self.send(receiver, mtype, Buffer::from_slice(text.as_bytes()), session)
    }

    /// Request/reply send: allocates the session and returns it.
    pub fn call(&self, receiver: u32, mtype: u8, data: Buffer) -> i64 {
        self.send(receiver, mtype, data, self.next_sequence())
    }

    /// Creates a service; the session resolves with an INTEGER message
    /// carrying the new id, or 0 on failure.
    pub fn new_service(&self, mut conf: ServiceConf) -> i64 {
        conf.creator = self.meta.id;
        conf.session = self.next_sequence();
        let session = conf.session;
        self.state.server.new_service(conf);
        session
    }

    pub fn kill(&self, serviceid: u32) {
        self.state.server.remove_service(serviceid, self.meta.id, 0);
    }

    /// Removes this service. The usual reaction to SHUTDOWN.
    pub fn quit(&self) {
        self.kill(self.meta.id);
    }

    pub fn query_service(&self, name: &str) -> u32 {
        self.state.server.get_unique_service(name)
    }

    /// JSON service listing of a worker; resolves the returned session.
    pub fn scan_services(&self, workerid: u32) -> i64 {
        let session = self.next_sequence();
        self.state
            .server
            .scan_services(self.meta.id, workerid, session);
        session
    }

    /// Arms a timer. Returns the timer id `T`; the expiry arrives as
    /// `{TIMER, sender: T, session: -T}`. Non-positive intervals fire
    /// without entering the wheel. Timers cannot be withdrawn, drop the
    /// message on arrival instead.
    pub fn timeout(&self, interval_ms: i64) -> i64 {
        let timerid = self.state.next_timer_id();
        self.state
            .server
            .timeout(interval_ms, self.meta.id, -timerid);
        timerid
    }

    pub fn exit(&self, code: i32) {
        self.state.server.stop(code);
    }

    pub fn server_state(&self) -> State {
        self.state.server.get_state()
    }

    pub fn server_info(&self) -> String {
        self.state.server.info()
    }

    // ---- environment & clock ------------------------------------------

    pub fn env(&self, name: &str) -> Option<Arc<String>> {
        self.state.server.get_env(name)
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.state.server.set_env(name.to_string(), value.to_string());
    }

    /// Cached wall clock (ms), refreshed by the main tick loop.
    pub fn now(&self) -> i64 {
        self.state.server.now()
    }

    /// Monotonic seconds, for interval measurements.
    pub fn clock(&self) -> f64 {
        crate::time::clock()
    }

    pub fn adjtime(&self, offset_ms: i64) {
        self.state.server.adjtime(offset_ms);
    }

    /// Emits a line attributed to this service id.
    pub fn log(&self, level: LogLevel, msg: &str) {
        log::global().logstring(true, level, msg, self.meta.id);
    }

    // ---- sockets ------------------------------------------------------

    /// Probes whether a host/port can be bound (or connected, with
    /// `is_connect`). Diagnostic helper, performs blocking socket calls.
    pub fn try_open(&self, host: &str, port: u16, is_connect: bool) -> bool {
        crate::net::try_open(host, port, is_connect)
    }

    /// Opens a TCP acceptor on this worker. Returns the acceptor fd and the
    /// bound address (useful with port 0).
    pub fn listen(
        &self,
        host: &str,
        port: u16,
        protocol: SocketProtocol,
    ) -> crate::AnyResult<(u32, SocketAddr)> {
        self.state
            .sockets
            .listen(&self.state, host, port, self.meta.id, protocol)
    }

    /// Requests one accepted connection for `owner` (session from
    /// [`next_sequence`](Self::next_sequence); the INTEGER reply carries the
    /// new fd). `session == 0` switches the acceptor to continuous mode
    /// where every connection is announced to `owner` via SOCKET_ACCEPT.
    pub fn accept(&self, fd: u32, owner: u32, session: i64) -> bool {
        self.state.sockets.accept(fd, session, owner)
    }

    /// Outbound connection owned by this service. The session resolves with
    /// INTEGER fd or ERROR.
    pub fn connect(&self, host: &str, port: u16, protocol: SocketProtocol, timeout_ms: u32) -> i64 {
        let session = self.next_sequence();
        self.state.sockets.connect(
            &self.state,
            host.to_string(),
            port,
            self.meta.id,
            protocol,
            session,
            timeout_ms,
        );
        session
    }

    /// Reads `n` bytes (`delim` empty) or up to and including `delim`
    /// (`"\n"`, `"\r\n"` or `"\r\n\r\n"`). Already-buffered data is
    /// returned directly; otherwise the request is recorded and a
    /// SOCKET_RECV with the negated session follows.
    pub fn read(&self, fd: u32, n: usize, delim: &str) -> ReadResult {
        let Some(op) = ReadOp::parse(n, delim) else {
            return ReadResult::Failed(format!("socket.read: invalid delim {delim:?}"));
        };
        let session = self.next_sequence();
        match self.state.sockets.read(fd, self.meta.id, op, session) {
            ReadStart::Direct(buf) => ReadResult::Data(buf),
            ReadStart::Pending => ReadResult::Pending(session),
            ReadStart::Closed(reason) => ReadResult::Failed(reason),
        }
    }

    /// Queues bytes on a connection (or a connected UDP fd). `mask` is a
    /// set of [`BufferFlag`](crate::buffer::BufferFlag) bits: close after
    /// send, websocket frame kind.
    pub fn write_mask(&self, fd: u32, data: Buffer, mask: u8) -> bool {
        self.state.sockets.write(&self.state, fd, data, mask)
    }

    pub fn write(&self, fd: u32, data: Buffer) -> bool {
        self.write_mask(fd, data, 0)
    }

    pub fn write_text(&self, fd: u32, text: &str) -> bool {
        self.write(fd, Buffer::from_slice(text.as_bytes()))
    }

    /// Forwards a received message's payload to a socket.
    pub fn write_message(&self, fd: u32, message: Message) -> bool {
        match message.into_buffer() {
            Some(buf) => self.write(fd, buf),
            None => false,
        }
    }

    pub fn close(&self, fd: u32) -> bool {
        self.state.sockets.close(&self.state, fd)
    }

    /// Re-tags a raw stream connection with a framed or websocket protocol
    /// before any protocol traffic.
    pub fn switch_type(&self, fd: u32, protocol: SocketProtocol) -> bool {
        self.state.sockets.switch_type(fd, protocol)
    }

    /// Idle timeout in seconds; the 10 s sweep closes idle offenders.
    pub fn settimeout(&self, fd: u32, seconds: u64) -> bool {
        self.state.sockets.settimeout(fd, seconds)
    }

    pub fn setnodelay(&self, fd: u32) -> bool {
        self.state.sockets.setnodelay(fd)
    }

    /// Enables chunked framing: 'r' for receive, 'w' for send.
    pub fn set_enable_chunked(&self, fd: u32, flag: &str) -> bool {
        self.state.sockets.set_enable_chunked(fd, flag)
    }

    /// Pending-send thresholds: crossing `warn` logs, crossing `error`
    /// closes with SOCKET_ERROR.
    pub fn set_send_queue_limit(&self, fd: u32, warn: usize, error: usize) -> bool {
        self.state.sockets.set_send_queue_limit(fd, warn, error)
    }

    pub fn getaddress(&self, fd: u32) -> String {
        self.state.sockets.getaddress(fd)
    }

    /// Opens a UDP endpoint; datagrams arrive as SOCKET_UDP with the
    /// encoded peer endpoint prepended. Returns the fd and the bound
    /// address (useful with port 0).
    pub fn udp_open(&self, host: Option<&str>, port: u16) -> crate::AnyResult<(u32, SocketAddr)> {
        self.state
            .sockets
            .udp_open(&self.state, self.meta.id, host, port)
    }

    /// Associates the default peer used by [`write`](Self::write) on this fd.
    pub fn udp_connect(&self, fd: u32, host: &str, port: u16) -> bool {
        self.state.sockets.udp_connect(fd, host, port)
    }

    /// Sends a datagram to an encoded endpoint (see [`make_endpoint`](Self::make_endpoint)).
    pub fn send_to(&self, fd: u32, address: &[u8], data: Buffer) -> bool {
        self.state.sockets.send_to(fd, address, data)
    }

    /// Encodes `host:port` into the compact on-wire endpoint form.
    pub fn make_endpoint(&self, host: &str, port: u16) -> Option<Vec<u8>> {
        let addr: SocketAddr = format!("{host}:{port}").parse().ok()?;
        Some(endpoint::encode(&addr))
    }

    /// Splits a SOCKET_UDP payload into the sender endpoint and the data.
    pub fn unpack_udp<'a>(&self, data: &'a [u8]) -> Option<(SocketAddr, &'a [u8])> {
        endpoint::decode(data)
    }
}

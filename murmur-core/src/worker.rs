//! Worker thread: message scheduler and host for pinned services.
//!
//! Each worker runs a single-threaded monoio runtime. Control operations
//! arrive on an unbounded task channel; data messages land in the
//! swap-on-read queue, and the producer observing the empty-to-non-empty
//! edge posts one `Drain` task for the whole backlog. Socket and timer
//! completions share the same loop, so a service handler always runs to
//! completion before the next message is dequeued.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    panic::AssertUnwindSafe,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;

use crate::{
    buffer::Buffer,
    context::ServiceContext,
    escape_print, log, log_debug, log_error, log_info, log_warn,
    message::{mtype, Message},
    net::{RemoteAccept, SocketServer},
    queue::SwapQueue,
    server::{Server, State},
    service::{Service, ServiceConf, ServiceMeta},
    time, RuntimeWrapper, BOOTSTRAP_ADDR, WORKER_ID_SHIFT, WORKER_MAX_SERVICE,
};

/// Handlers running longer than this get flagged in the log.
const SLOW_DISPATCH_SECS: f64 = 0.1;

pub(crate) enum WorkerTask {
    Drain,
    NewService(Box<ServiceConf>),
    RemoveService {
        serviceid: u32,
        sender: u32,
        session: i64,
    },
    Scan {
        sender: u32,
        session: i64,
    },
    Ping,
    Stop,
    Exit,
    /// Cross-worker accept handoff: the connection must be built on the
    /// owner's runtime, so the listening worker ships a listener handle
    /// over and the owner accepts there.
    AcceptOn(RemoteAccept),
}

/// The thread-safe face of a worker: queue, counters and the task channel.
/// Everything the worker actually owns lives in [`WorkerState`] on its own
/// thread.
pub struct Worker {
    id: u32,
    shared: AtomicBool,
    count: AtomicU32,
    swapped: AtomicUsize,
    version: AtomicU32,
    cpu_micros: AtomicU64,
    signal_value: AtomicI32,
    current: AtomicU32,
    mq: SwapQueue<Message>,
    tx: UnboundedSender<WorkerTask>,
    rx: Mutex<Option<UnboundedReceiver<WorkerTask>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(id: u32) -> Self {
        let (tx, rx) = unbounded();
        Self {
            id,
            shared: AtomicBool::new(true),
            count: AtomicU32::new(0),
            swapped: AtomicUsize::new(0),
            version: AtomicU32::new(0),
            cpu_micros: AtomicU64::new(0),
            signal_value: AtomicI32::new(0),
            current: AtomicU32::new(0),
            mq: SwapQueue::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    pub fn set_shared(&self, v: bool) {
        self.shared.store(v, Ordering::Relaxed);
    }

    /// Live services on this worker.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Queue depth: pending backlog plus the swapped batch still being
    /// dispatched.
    pub fn mq_size(&self) -> usize {
        self.mq.len() + self.swapped.load(Ordering::Relaxed)
    }

    /// Liveness generation: returns the last observed value and posts a
    /// ping the worker answers by bumping it. A stuck worker stops
    /// advancing.
    pub fn alive(&self) -> u32 {
        let n = self.version.load(Ordering::Relaxed);
        let _ = self.tx.unbounded_send(WorkerTask::Ping);
        n
    }

    pub fn take_cpu(&self) -> f64 {
        self.cpu_micros.swap(0, Ordering::Relaxed) as f64 / 1e6
    }

    fn add_cpu(&self, seconds: f64) {
        self.cpu_micros
            .fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
    }

    /// Forwards a signal value to the service currently dispatching; it is
    /// observed via [`ServiceContext::take_signal`] and best-effort by
    /// design.
    pub fn signal(&self, value: i32) {
        self.signal_value.store(value, Ordering::Release);
    }

    pub(crate) fn take_signal(&self) -> i32 {
        self.signal_value.swap(0, Ordering::AcqRel)
    }

    /// The service id currently being dispatched, 0 when idle.
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    /// Enqueues a message. The producer seeing the queue go non-empty is
    /// the one that schedules the drain; later producers piggy-back.
    pub fn send(&self, message: Message) {
        if self.mq.push(message) == 1 {
            let _ = self.tx.unbounded_send(WorkerTask::Drain);
        }
    }

    pub(crate) fn new_service(&self, conf: ServiceConf) {
        self.count.fetch_add(1, Ordering::Release);
        let _ = self
            .tx
            .unbounded_send(WorkerTask::NewService(Box::new(conf)));
    }

    pub(crate) fn remove_service(&self, serviceid: u32, sender: u32, session: i64) {
        let _ = self.tx.unbounded_send(WorkerTask::RemoveService {
            serviceid,
            sender,
            session,
        });
    }

    pub(crate) fn scan(&self, sender: u32, session: i64) {
        let _ = self.tx.unbounded_send(WorkerTask::Scan { sender, session });
    }

    pub(crate) fn accept_on(&self, req: RemoteAccept) {
        let _ = self.tx.unbounded_send(WorkerTask::AcceptOn(req));
    }

    /// Asks the worker to broadcast SHUTDOWN to its services.
    pub(crate) fn stop(&self) {
        let _ = self.tx.unbounded_send(WorkerTask::Stop);
    }

    pub(crate) fn exit(&self) {
        let _ = self.tx.unbounded_send(WorkerTask::Exit);
    }

    pub(crate) fn run(&self, server: Arc<Server>) {
        let id = self.id;
        let handle = std::thread::Builder::new()
            .name(format!("murmur-worker-{id}"))
            .spawn(move || {
                let mut runtime = RuntimeWrapper::new();
                runtime.block_on(worker_main(server, id));
            })
            .expect("start worker thread failed");
        *self.thread.lock().unwrap() = Some(handle);
    }

    pub(crate) fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

struct ServiceSlot {
    meta: Rc<ServiceMeta>,
    imp: Box<dyn Service>,
}

/// Everything a worker owns on its own thread. Shared via `Rc` with the
/// socket tasks spawned on the same runtime, never across threads.
pub struct WorkerState {
    pub(crate) server: Arc<Server>,
    id: u32,
    services: RefCell<HashMap<u32, ServiceSlot>>,
    nextid: Cell<u32>,
    next_timer: Cell<i64>,
    pub(crate) sockets: SocketServer,
}

impl WorkerState {
    fn new(server: Arc<Server>, id: u32) -> Rc<Self> {
        let sockets = SocketServer::new(server.clone(), id);
        Rc::new(Self {
            server,
            id,
            services: RefCell::new(HashMap::new()),
            nextid: Cell::new(0),
            next_timer: Cell::new(0),
            sockets,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn me(&self) -> &Worker {
        &self.server.workers()[(self.id - 1) as usize]
    }

    pub(crate) fn take_signal(&self) -> i32 {
        self.me().take_signal()
    }

    /// Per-worker monotonic timer id.
    pub(crate) fn next_timer_id(&self) -> i64 {
        let v = self.next_timer.get() + 1;
        self.next_timer.set(v);
        v
    }

    pub(crate) fn has_service(&self, serviceid: u32) -> bool {
        self.services.borrow().contains_key(&serviceid)
    }

    fn allocate_service_id(&self, opt_service_id: u32) -> u32 {
        let services = self.services.borrow();
        if opt_service_id != 0 {
            if services.contains_key(&opt_service_id) {
                log_error!(
                    "new service failed: serviceid [{:08X}] already exists, worker[{}] service num[{}].",
                    opt_service_id,
                    self.id,
                    services.len()
                );
                return 0;
            }
            return opt_service_id;
        }
        let mut counter = 0usize;
        loop {
            if counter >= WORKER_MAX_SERVICE as usize {
                log_error!(
                    "new service failed: can not get more service id. worker[{}] service num[{}].",
                    self.id,
                    services.len()
                );
                return 0;
            }
            let mut next = self.nextid.get() + 1;
            if next == WORKER_MAX_SERVICE {
                next = 1;
            }
            self.nextid.set(next);
            let serviceid = next | (self.id << WORKER_ID_SHIFT);
            if !services.contains_key(&serviceid) {
                return serviceid;
            }
            counter += 1;
        }
    }
}

/// Dispatches one message into a resident service, measuring wall time and
/// honoring the redirect contract. Returns false when the target is
/// missing or no longer accepting messages.
fn dispatch_to(state: &Rc<WorkerState>, serviceid: u32, msg: &mut Message) -> bool {
    let Some(mut slot) = state.services.borrow_mut().remove(&serviceid) else {
        return false;
    };
    if !slot.meta.ok() {
        state.services.borrow_mut().insert(serviceid, slot);
        return false;
    }

    let me = state.me();
    let ctx = ServiceContext::new(state.clone(), slot.meta.clone());
    me.current.store(serviceid, Ordering::Release);
    log::set_current_service(serviceid);

    let (sender, receiver, kind) = (msg.sender, msg.receiver, msg.mtype);
    let start = time::clock();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| slot.imp.dispatch(&ctx, msg)));
    let elapsed = time::clock() - start;

    log::set_current_service(0);
    me.current.store(0, Ordering::Release);
    slot.meta.add_cpu(elapsed);
    me.add_cpu(elapsed);
    if elapsed > SLOW_DISPATCH_SECS {
        log_warn!(
            "worker {} handle one message({}) cost {:.3}s, from {:08X} to {:08X}",
            me.id(),
            kind,
            elapsed,
            sender,
            receiver
        );
    }

    match outcome {
        Ok(()) => {
            state.services.borrow_mut().insert(serviceid, slot);
            // the handler may have redirected the message to a new receiver;
            // broadcast deliveries are shared and cannot be redirected
            if receiver != 0 && msg.receiver != receiver && msg.receiver != 0 {
                let redirected = std::mem::take(msg);
                state.server.send_message(redirected);
            }
        }
        Err(_) => {
            slot.meta.set_ok(false);
            log_error!(
                "service [{:08X}] {} panicked handling message({}) from {:08X}",
                serviceid,
                slot.meta.name,
                kind,
                sender
            );
            drop(slot);
            crash_service(state, serviceid);
        }
    }
    true
}

/// Crash surfacing: the service is gone from its worker, the process hears
/// about it, and a dead bootstrap takes the runtime down with it.
fn crash_service(state: &Rc<WorkerState>, serviceid: u32) {
    let me = state.me();
    me.count.fetch_sub(1, Ordering::Release);
    if state.services.borrow().is_empty() {
        me.set_shared(true);
    }
    if state.server.get_state() == State::Ready {
        announce_exit(state, serviceid, "crashed");
    }
    if serviceid == BOOTSTRAP_ADDR {
        state.server.set_state(State::Stopping);
        state.server.stop(1);
    }
}

fn announce_exit(state: &Rc<WorkerState>, serviceid: u32, name: &str) {
    let content = format!("_service_exit,name:{name} serviceid:{serviceid:08X}");
    let buf = Buffer::from_slice(content.as_bytes());
    state.server.broadcast(serviceid, &buf, mtype::SYSTEM);
}

/// Entry point shared by the drain loop and the socket tasks: resolves the
/// receiver locally and falls back to the dead-service protocol.
pub(crate) fn handle_message(state: &Rc<WorkerState>, mut msg: Message) {
    let receiver = msg.receiver;
    if receiver > 0 {
        if dispatch_to(state, receiver, &mut msg) {
            return;
        }
        let (sender, session) = (msg.sender, msg.session);
        if sender == 0 || msg.mtype == mtype::TIMER {
            return;
        }
        if session >= 0 {
            log_debug!(
                "Dead service [{:08X}] recv message from [{:08X}]: {}.",
                receiver,
                sender,
                escape_print(msg.data())
            );
        } else {
            // resolve the caller's pending request with a failure; the
            // session stays sign-flipped relative to what the caller sent
            let reason = format!(
                "Attempt call dead service [{:08X}]: {}.",
                receiver,
                escape_print(msg.data())
            );
            state.server.send_message(Message::with_text(
                mtype::ERROR,
                receiver,
                sender,
                session,
                &reason,
            ));
        }
        return;
    }

    // broadcast: every local service except the sender; SYSTEM messages
    // are only for unique services
    let ids: Vec<u32> = state.services.borrow().keys().copied().collect();
    for id in ids {
        if id == msg.sender {
            continue;
        }
        if msg.mtype == mtype::SYSTEM {
            let unique = state
                .services
                .borrow()
                .get(&id)
                .map(|s| s.meta.unique)
                .unwrap_or(false);
            if !unique {
                continue;
            }
        }
        dispatch_to(state, id, &mut msg);
    }
}

fn spawn_service(state: &Rc<WorkerState>, conf: ServiceConf) {
    let fail = |state: &Rc<WorkerState>| {
        let me = state.me();
        me.count.fetch_sub(1, Ordering::Release);
        if state.services.borrow().is_empty() {
            me.set_shared(true);
        }
        if conf.session != 0 {
            state.server.send_message(Message::with_integer(
                mtype::INTEGER,
                0,
                conf.creator,
                -conf.session,
                0,
            ));
        }
    };

    let serviceid = state.allocate_service_id(conf.opt_service_id);
    if serviceid == 0 {
        fail(state);
        return;
    }

    let Some(mut imp) = state.server.make_service(&conf.stype) else {
        log_error!(
            "new service failed: service type [{}] was not registered",
            conf.stype
        );
        fail(state);
        return;
    };

    let meta = ServiceMeta::new(serviceid, conf.name.clone(), conf.unique, conf.memlimit);
    let ctx = ServiceContext::new(state.clone(), meta.clone());
    log::set_current_service(serviceid);
    let inited = imp.init(&ctx, &conf);
    log::set_current_service(0);

    if let Err(e) = inited {
        log_error!("new service [{}] init failed: {:?}", conf.stype, e);
        if serviceid == BOOTSTRAP_ADDR {
            state.server.stop(-1);
        }
        fail(state);
        return;
    }

    if conf.unique
        && !state
            .server
            .set_unique_service(conf.name.clone(), serviceid)
    {
        log_error!(
            "new service failed: unique service [{}] already registered",
            conf.name
        );
        fail(state);
        return;
    }

    meta.set_ok(true);
    state
        .services
        .borrow_mut()
        .insert(serviceid, ServiceSlot { meta, imp });

    if conf.session != 0 {
        state.server.send_message(Message::with_integer(
            mtype::INTEGER,
            0,
            conf.creator,
            -conf.session,
            serviceid as i64,
        ));
    }
}

fn remove_service_local(state: &Rc<WorkerState>, serviceid: u32, sender: u32, session: i64) {
    let removed = state.services.borrow_mut().remove(&serviceid);
    match removed {
        Some(slot) => {
            let me = state.me();
            me.count.fetch_sub(1, Ordering::Release);
            state
                .server
                .response(sender, "service destroy", session, mtype::TEXT);
            if state.services.borrow().is_empty() {
                me.set_shared(true);
            }
            if state.server.get_state() == State::Ready {
                announce_exit(state, serviceid, &slot.meta.name);
            }
            if serviceid == BOOTSTRAP_ADDR {
                state.server.set_state(State::Stopping);
            }
        }
        None => state.server.response(
            sender,
            &format!("worker::remove_service [{serviceid:08X}] not found"),
            session,
            mtype::ERROR,
        ),
    }
}

fn scan_local(state: &Rc<WorkerState>, sender: u32, session: i64) {
    let services = state.services.borrow();
    let entries: Vec<serde_json::Value> = services
        .values()
        .map(|slot| {
            serde_json::json!({
                "name": slot.meta.name,
                "serviceid": format!("{:X}", slot.meta.id),
            })
        })
        .collect();
    drop(services);
    let content = serde_json::to_string(&entries).unwrap_or_default();
    state.server.response(sender, &content, session, mtype::TEXT);
}

fn shutdown_local(state: &Rc<WorkerState>) {
    let ids: Vec<u32> = state.services.borrow().keys().copied().collect();
    let mut msg = Message::with_empty(mtype::SHUTDOWN, 0, 0, 0);
    for id in ids {
        dispatch_to(state, id, &mut msg);
    }
}

async fn worker_main(server: Arc<Server>, id: u32) {
    let me = &server.workers()[(id - 1) as usize];
    let mut rx = me
        .rx
        .lock()
        .unwrap()
        .take()
        .expect("worker receiver already taken");
    let state = WorkerState::new(server.clone(), id);
    state.sockets.start(&state);

    log_info!("WORKER-{} START", id);
    let mut backlog: Vec<Message> = Vec::new();
    while let Some(task) = rx.next().await {
        match task {
            WorkerTask::Drain => {
                me.mq.swap_into(&mut backlog);
                let mut remaining = backlog.len();
                me.swapped.store(remaining, Ordering::Relaxed);
                for msg in backlog.drain(..) {
                    remaining -= 1;
                    me.swapped.store(remaining, Ordering::Relaxed);
                    handle_message(&state, msg);
                }
            }
            WorkerTask::NewService(conf) => spawn_service(&state, *conf),
            WorkerTask::RemoveService {
                serviceid,
                sender,
                session,
            } => remove_service_local(&state, serviceid, sender, session),
            WorkerTask::Scan { sender, session } => scan_local(&state, sender, session),
            WorkerTask::Ping => {
                me.version.fetch_add(1, Ordering::Relaxed);
            }
            WorkerTask::Stop => shutdown_local(&state),
            WorkerTask::AcceptOn(req) => crate::net::accept_remote(&state, req),
            WorkerTask::Exit => break,
        }
    }
    state.sockets.close_all();
    state.services.borrow_mut().clear();
    log_info!("WORKER-{} STOP", id);
}

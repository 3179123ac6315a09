//! Global orchestrator: worker fleet, message router, env and unique-name
//! maps, fd watcher, timing wheels and the main tick loop.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use crate::{
    buffer::Buffer,
    log, log_debug, log_error, log_info, log_warn,
    message::{mtype, Message},
    service::{ServiceConf, ServiceFactory},
    time,
    timer::TimingWheel,
    worker::Worker,
    worker_id,
};

const EXITCODE_UNSET: i32 = i32::MAX;
const TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Unknown = 0,
    Init = 1,
    Ready = 2,
    Stopping = 3,
    Stopped = 4,
}

fn state_from(v: u8) -> State {
    match v {
        1 => State::Init,
        2 => State::Ready,
        3 => State::Stopping,
        4 => State::Stopped,
        _ => State::Unknown,
    }
}

/// What a timing-wheel bucket stores: enough to synthesize the TIMER
/// message when the wheel fires.
struct TimerContext {
    serviceid: u32,
    timerid: i64,
}

pub struct Server {
    exitcode: AtomicI32,
    state: AtomicU8,
    fd_seq: AtomicU32,
    now_ms: AtomicI64,
    clock_offset: AtomicI64,
    fd_watcher: Mutex<HashSet<u32>>,
    registry: Mutex<HashMap<String, ServiceFactory>>,
    env: RwLock<HashMap<String, Arc<String>>>,
    unique_services: RwLock<HashMap<String, u32>>,
    timers: Vec<Mutex<TimingWheel<TimerContext>>>,
    workers: Vec<Worker>,
}

impl Server {
    /// Builds the server with `worker_num` workers (clamped to 1..=255).
    /// Worker threads start in [`Server::init`].
    pub fn new(worker_num: u32) -> Arc<Self> {
        time::init();
        let worker_num = worker_num.clamp(1, 255);
        let workers = (1..=worker_num).map(Worker::new).collect::<Vec<_>>();
        let timers = (0..worker_num)
            .map(|_| Mutex::new(TimingWheel::new()))
            .collect();
        Arc::new(Self {
            exitcode: AtomicI32::new(EXITCODE_UNSET),
            state: AtomicU8::new(State::Unknown as u8),
            fd_seq: AtomicU32::new(1),
            now_ms: AtomicI64::new(0),
            clock_offset: AtomicI64::new(0),
            fd_watcher: Mutex::new(HashSet::new()),
            registry: Mutex::new(HashMap::new()),
            env: RwLock::new(HashMap::new()),
            unique_services: RwLock::new(HashMap::new()),
            timers,
            workers,
        })
    }

    /// Registers a service type. Double registration is a startup bug.
    pub fn register_service(&self, stype: &str, factory: ServiceFactory) {
        let mut reg = self.registry.lock().unwrap();
        assert!(
            reg.insert(stype.to_string(), factory).is_none(),
            "already registered service type [{stype}]"
        );
    }

    pub fn make_service(&self, stype: &str) -> Option<Box<dyn crate::service::Service>> {
        let reg = self.registry.lock().unwrap();
        reg.get(stype).map(|f| f())
    }

    /// Starts the worker threads.
    pub fn init(self: &Arc<Self>) {
        log::global().ensure_ready();
        log_info!("INIT with {} workers.", self.workers.len());
        for worker in &self.workers {
            worker.run(self.clone());
        }
        self.set_state(State::Init);
    }

    /// Main tick loop. Returns the process exit code.
    pub fn run(self: &Arc<Self>) -> i32 {
        let mut stop_once = false;
        self.set_state(State::Ready);
        loop {
            self.refresh_now();

            let exitcode = self.exitcode.load(Ordering::Acquire);
            if exitcode < 0 {
                break;
            }

            if exitcode != EXITCODE_UNSET && !stop_once {
                stop_once = true;
                log_warn!("Received exit code {}", exitcode);
                // teardown begins now, not when bootstrap happens to die
                self.set_state(State::Stopping);
                for worker in self.workers.iter().rev() {
                    worker.stop();
                }
            }

            if self.get_state() == State::Stopping
                && self.workers.iter().all(|w| w.count() == 0)
            {
                break;
            }

            self.update_timers();
            std::thread::sleep(TICK);
        }
        self.wait();
        let _ = self.exitcode.compare_exchange(
            EXITCODE_UNSET,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.exitcode.load(Ordering::Relaxed)
    }

    /// Records the exit intent. The first writer wins; the tick loop picks
    /// it up and starts teardown.
    pub fn stop(&self, exitcode: i32) {
        let _ = self.exitcode.compare_exchange(
            EXITCODE_UNSET,
            exitcode,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Joins every worker, newest first.
    fn wait(&self) {
        for worker in self.workers.iter().rev() {
            worker.exit();
        }
        for worker in self.workers.iter().rev() {
            worker.join();
        }
        self.set_state(State::Stopped);
    }

    pub fn get_state(&self) -> State {
        state_from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn refresh_now(&self) {
        let now = time::wall_now_ms() + self.clock_offset.load(Ordering::Relaxed);
        self.now_ms.store(now, Ordering::Relaxed);
    }

    /// Cached wall clock in ms. Single-writer approximation: the tick loop
    /// refreshes it once per millisecond and everyone else reads relaxed,
    /// which is precise enough for timers and sweeps.
    pub fn now(&self) -> i64 {
        match self.now_ms.load(Ordering::Relaxed) {
            0 => time::wall_now_ms() + self.clock_offset.load(Ordering::Relaxed),
            now => now,
        }
    }

    /// Applies artificial clock skew and resyncs the cache.
    pub fn adjtime(&self, offset_ms: i64) {
        self.clock_offset.fetch_add(offset_ms, Ordering::Relaxed);
        self.refresh_now();
    }

    pub fn service_count(&self) -> u32 {
        self.workers.iter().map(|w| w.count()).sum()
    }

    pub(crate) fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Single pass: the least-loaded `shared` worker wins, with the overall
    /// least-loaded worker as fallback.
    fn next_worker(&self) -> &Worker {
        let mut min_shared: Option<&Worker> = None;
        let mut min_all: &Worker = &self.workers[0];
        for worker in &self.workers {
            let n = worker.count();
            if worker.shared() && min_shared.map_or(true, |w| n < w.count()) {
                min_shared = Some(worker);
            }
            if n < min_all.count() {
                min_all = worker;
            }
        }
        min_shared.unwrap_or(min_all)
    }

    pub(crate) fn get_worker(&self, workerid: u32, serviceid: u32) -> Option<&Worker> {
        let workerid = if workerid != 0 {
            workerid
        } else {
            worker_id(serviceid)
        };
        if workerid == 0 || workerid as usize > self.workers.len() {
            return None;
        }
        Some(&self.workers[workerid as usize - 1])
    }

    /// Schedules a TIMER delivery for `serviceid` after `interval` ms.
    /// Non-positive intervals fire immediately instead of entering the
    /// wheel. `timerid` is the negated caller token.
    pub fn timeout(&self, interval: i64, serviceid: u32, timerid: i64) {
        if interval <= 0 {
            self.on_timer(serviceid, timerid);
            return;
        }
        let Some(worker) = self.get_worker(0, serviceid) else {
            return;
        };
        let index = worker.id() as usize - 1;
        self.timers[index].lock().unwrap().add(
            self.now() + interval,
            TimerContext { serviceid, timerid },
        );
    }

    fn on_timer(&self, serviceid: u32, timerid: i64) {
        self.send_message(Message::with_integer(
            mtype::TIMER,
            timerid.unsigned_abs() as u32,
            serviceid,
            timerid,
            timerid.abs(),
        ));
    }

    fn update_timers(&self) {
        let now = self.now();
        let mut fired = Vec::new();
        for wheel in &self.timers {
            wheel
                .lock()
                .unwrap()
                .update(now, |ctx: TimerContext| fired.push(ctx));
            for ctx in fired.drain(..) {
                self.on_timer(ctx.serviceid, ctx.timerid);
            }
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.iter().map(|t| t.lock().unwrap().len()).sum()
    }

    /// Hands the conf to a worker: an explicit `threadid` pins the service
    /// and takes that worker out of the shared pool, otherwise the router
    /// picks one.
    pub fn new_service(&self, conf: ServiceConf) {
        let worker = match self.get_worker(conf.threadid, 0) {
            Some(w) => {
                w.set_shared(false);
                w
            }
            None => self.next_worker(),
        };
        worker.new_service(conf);
    }

    pub fn remove_service(&self, serviceid: u32, sender: u32, session: i64) {
        match self.get_worker(0, serviceid) {
            Some(w) => w.remove_service(serviceid, sender, session),
            None => self.response(
                sender,
                &format!("server::remove_service invalid service id {serviceid:08X}."),
                session,
                mtype::ERROR,
            ),
        }
    }

    /// Asks a worker for its service list; the JSON reply resolves the
    /// caller's session.
    pub fn scan_services(&self, sender: u32, workerid: u32, session: i64) -> bool {
        match self.get_worker(workerid, 0) {
            Some(w) => {
                w.scan(sender, session);
                true
            }
            None => false,
        }
    }

    /// Routes a message to its receiver's worker. Receiver 0 fans out as a
    /// broadcast; out-of-range receivers are refused here, at the API edge.
    pub fn send_message(&self, message: Message) -> bool {
        debug_assert!(message.mtype != mtype::UNKNOWN, "invalid message type");
        if message.receiver == 0 {
            return match message.as_buffer() {
                Some(buf) => {
                    self.broadcast(message.sender, buf, message.mtype);
                    true
                }
                None => false,
            };
        }
        match self.get_worker(0, message.receiver) {
            Some(w) => {
                w.send(message);
                true
            }
            None => {
                log_error!("Invalid message receiver id: {:X}", message.receiver);
                false
            }
        }
    }

    /// Sends on behalf of a service, negating the session so request and
    /// response are distinguishable by sign.
    pub fn send(
        &self,
        sender: u32,
        receiver: u32,
        data: Buffer,
        session: i64,
        mtype: u8,
    ) -> bool {
        self.send_message(Message::with_bytes(mtype, sender, receiver, -session, data))
    }

    /// Clones the payload into every worker's queue tagged receiver 0.
    /// Workers deliver to every local service except the sender; SYSTEM
    /// broadcasts reach only unique services.
    pub fn broadcast(&self, sender: u32, buf: &Buffer, mtype: u8) {
        for worker in &self.workers {
            let mut message = Message::with_bytes(mtype, sender, 0, 0, buf.clone());
            message.set_broadcast();
            worker.send(message);
        }
    }

    /// Framework-to-service reply. Fire-and-forget calls (`to` or `session`
    /// zero) are dropped, with dropped errors surfaced in the debug log
    /// while the server is ready.
    pub fn response(&self, to: u32, content: &str, session: i64, mtype_: u8) {
        if to == 0 || session == 0 {
            if self.get_state() == State::Ready && mtype_ == mtype::ERROR && !content.is_empty() {
                log_debug!("{}", content);
            }
            return;
        }
        self.send_message(Message::with_text(mtype_, 0, to, -session, content));
    }

    pub fn get_env(&self, name: &str) -> Option<Arc<String>> {
        self.env.read().unwrap().get(name).cloned()
    }

    pub fn set_env(&self, name: String, value: String) {
        self.env.write().unwrap().insert(name, Arc::new(value));
    }

    pub fn get_unique_service(&self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        self.unique_services
            .read()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Registers a unique name. Idempotent for the same id; a different id
    /// is refused, the map is monotonic while the server is ready.
    pub fn set_unique_service(&self, name: String, serviceid: u32) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut map = self.unique_services.write().unwrap();
        match map.get(&name) {
            Some(&existing) => existing == serviceid,
            None => {
                map.insert(name, serviceid);
                true
            }
        }
    }

    pub fn unique_service_count(&self) -> usize {
        self.unique_services.read().unwrap().len()
    }

    /// Allocates a process-wide socket handle: never zero, never currently
    /// live.
    pub fn next_fd(&self) -> u32 {
        loop {
            let fd = self.fd_seq.fetch_add(1, Ordering::Relaxed);
            if fd != 0 && self.try_lock_fd(fd) {
                return fd;
            }
        }
    }

    pub fn try_lock_fd(&self, fd: u32) -> bool {
        self.fd_watcher.lock().unwrap().insert(fd)
    }

    pub fn unlock_fd(&self, fd: u32) {
        let removed = self.fd_watcher.lock().unwrap().remove(&fd);
        debug_assert!(removed, "socket fd erase failed");
    }

    pub fn socket_num(&self) -> usize {
        self.fd_watcher.lock().unwrap().len()
    }

    /// Runtime overview as a JSON array: one entry for the server followed
    /// by one per worker.
    pub fn info(&self) -> String {
        let mut entries = vec![serde_json::json!({
            "id": 0,
            "socket": self.socket_num(),
            "timer": self.timer_count(),
            "log": log::global().size(),
            "service": self.service_count(),
            "error": log::global().error_count(),
        })];
        for (index, worker) in self.workers.iter().enumerate() {
            entries.push(serde_json::json!({
                "id": worker.id(),
                "cpu": worker.take_cpu(),
                "mqsize": worker.mq_size(),
                "service": worker.count(),
                "timer": self.timers[index].lock().unwrap().len(),
                "alive": worker.alive(),
            }));
        }
        serde_json::to_string(&entries).unwrap_or_default()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for worker in self.workers.iter().rev() {
            worker.exit();
        }
        for worker in self.workers.iter().rev() {
            worker.join();
        }
    }
}

//! Shared integration-test fixture: a scripted driver service.
//!
//! The driver forwards every message it receives into a per-name channel
//! the test thread listens on, and executes text commands sent to it as
//! LUA messages from the test (sender 0). Command results come back as
//! [`Event::Result`] lines.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};

use murmur_core::{
    buffer::Buffer,
    context::{ReadResult, ServiceContext},
    message::{mtype, Message, Payload},
    server::Server,
    service::{Service, ServiceConf},
    AnyResult,
};

#[derive(Debug, Clone)]
pub enum Event {
    Started { id: u32 },
    Msg {
        mtype: u8,
        sender: u32,
        session: i64,
        data: Vec<u8>,
        integer: i64,
    },
    Result(String),
}

fn registry() -> &'static Mutex<HashMap<String, Sender<Event>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Sender<Event>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers the channel a driver named `name` will report into. Use a
/// test-unique name, the registry is process-wide.
pub fn listen_for(name: &str) -> Receiver<Event> {
    let (tx, rx) = channel();
    registry().lock().unwrap().insert(name.to_string(), tx);
    rx
}

pub struct DriverService {
    events: Option<Sender<Event>>,
}

pub fn make_driver() -> Box<dyn Service> {
    Box::new(DriverService { events: None })
}

impl DriverService {
    fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn run_command(&self, ctx: &ServiceContext, line: &str) {
        let parts: Vec<&str> = line.split(' ').collect();
        match parts.as_slice() {
            ["exit", code] => ctx.exit(code.parse().unwrap()),
            ["quit"] => ctx.quit(),
            ["kill", id] => ctx.kill(id.parse().unwrap()),
            ["timeout", ms] => {
                let timerid = ctx.timeout(ms.parse().unwrap());
                self.emit(Event::Result(format!("timer {timerid}")));
            }
            ["send", receiver, session, text] => {
                ctx.send_text(
                    receiver.parse().unwrap(),
                    mtype::LUA,
                    text,
                    session.parse().unwrap(),
                );
            }
            ["call", receiver, text] => {
                let session = ctx.call(
                    receiver.parse().unwrap(),
                    mtype::LUA,
                    Buffer::from_slice(text.as_bytes()),
                );
                self.emit(Event::Result(format!("session {session}")));
            }
            ["newservice", json] => {
                let conf: ServiceConf = serde_json::from_str(json).unwrap();
                let session = ctx.new_service(conf);
                self.emit(Event::Result(format!("session {session}")));
            }
            ["query", name] => {
                self.emit(Event::Result(format!("id {}", ctx.query_service(name))));
            }
            ["listen", host, port, protocol] => {
                match ctx.listen(host, port.parse().unwrap(), protocol.parse().unwrap()) {
                    Ok((fd, addr)) => {
                        self.emit(Event::Result(format!("listen {fd} {}", addr.port())))
                    }
                    Err(e) => self.emit(Event::Result(format!("listen-error {e}"))),
                }
            }
            ["accept", fd, session] => {
                let ok = ctx.accept(fd.parse().unwrap(), ctx.id(), session.parse().unwrap());
                self.emit(Event::Result(format!("accept {ok}")));
            }
            ["connect", host, port, protocol, timeout] => {
                let session = ctx.connect(
                    host,
                    port.parse().unwrap(),
                    protocol.parse().unwrap(),
                    timeout.parse().unwrap(),
                );
                self.emit(Event::Result(format!("session {session}")));
            }
            ["read", fd, n, delim] => {
                let delim = delim.replace("\\r", "\r").replace("\\n", "\n").replace('_', "");
                match ctx.read(fd.parse().unwrap(), n.parse().unwrap(), &delim) {
                    ReadResult::Data(buf) => self.emit(Event::Result(format!(
                        "data {}",
                        String::from_utf8_lossy(buf.as_slice())
                    ))),
                    ReadResult::Pending(session) => {
                        self.emit(Event::Result(format!("pending {session}")))
                    }
                    ReadResult::Failed(reason) => {
                        self.emit(Event::Result(format!("failed {reason}")))
                    }
                }
            }
            ["write", fd, text] => {
                let ok = ctx.write_text(fd.parse().unwrap(), text);
                self.emit(Event::Result(format!("write {ok}")));
            }
            ["close", fd] => {
                let ok = ctx.close(fd.parse().unwrap());
                self.emit(Event::Result(format!("close {ok}")));
            }
            ["chunked", fd, flags] => {
                let ok = ctx.set_enable_chunked(fd.parse().unwrap(), flags);
                self.emit(Event::Result(format!("chunked {ok}")));
            }
            ["switch", fd, protocol] => {
                let ok = ctx.switch_type(fd.parse().unwrap(), protocol.parse().unwrap());
                self.emit(Event::Result(format!("switch {ok}")));
            }
            ["udpopen"] => match ctx.udp_open(Some("127.0.0.1"), 0) {
                Ok((fd, addr)) => self.emit(Event::Result(format!("udp {fd} {}", addr.port()))),
                Err(e) => self.emit(Event::Result(format!("udp-error {e}"))),
            },
            ["sendto", fd, host, port, text] => {
                let ep = ctx.make_endpoint(host, port.parse().unwrap()).unwrap();
                let ok = ctx.send_to(
                    fd.parse().unwrap(),
                    &ep,
                    Buffer::from_slice(text.as_bytes()),
                );
                self.emit(Event::Result(format!("sendto {ok}")));
            }
            other => self.emit(Event::Result(format!("unknown-command {other:?}"))),
        }
    }
}

impl Service for DriverService {
    fn init(&mut self, ctx: &ServiceContext, conf: &ServiceConf) -> AnyResult<()> {
        self.events = registry().lock().unwrap().get(&conf.name).cloned();
        self.emit(Event::Started { id: ctx.id() });
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        if msg.mtype == mtype::SHUTDOWN {
            ctx.quit();
            return;
        }
        if msg.mtype == mtype::LUA && msg.sender == 0 && msg.session == 0 {
            let line = String::from_utf8_lossy(msg.data()).to_string();
            self.run_command(ctx, &line);
            return;
        }
        let integer = msg.as_integer();
        let data = msg.data().to_vec();
        self.emit(Event::Msg {
            mtype: msg.mtype,
            sender: msg.sender,
            session: msg.session,
            data,
            integer,
        });
    }
}

/// Minimal responder used as a peer for request/reply tests.
pub struct EchoPeer;

pub fn make_echo() -> Box<dyn Service> {
    Box::new(EchoPeer)
}

impl Service for EchoPeer {
    fn init(&mut self, _ctx: &ServiceContext, _conf: &ServiceConf) -> AnyResult<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        match msg.mtype {
            mtype::LUA if msg.session != 0 && msg.sender != 0 => {
                let data = match std::mem::take(&mut msg.payload) {
                    Payload::Bytes(b) => b,
                    _ => Buffer::new(),
                };
                ctx.send(msg.sender, mtype::LUA, data, msg.session);
            }
            mtype::SHUTDOWN => ctx.quit(),
            _ => {}
        }
    }
}

/// Boots a server with the driver/echo types registered and a bootstrap
/// driver named `boot_name`, and runs the tick loop on a background
/// thread.
pub struct TestHost {
    pub server: Arc<Server>,
    run: Option<std::thread::JoinHandle<i32>>,
}

impl TestHost {
    pub fn start(workers: u32, boot_name: &str) -> (Self, Receiver<Event>) {
        let rx = listen_for(boot_name);
        let server = Server::new(workers);
        server.register_service("driver", make_driver);
        server.register_service("echo", make_echo);
        server.init();

        let conf = ServiceConf {
            stype: "driver".to_string(),
            name: boot_name.to_string(),
            threadid: 1,
            opt_service_id: murmur_core::BOOTSTRAP_ADDR,
            ..Default::default()
        };
        server.new_service(conf);

        let run_server = server.clone();
        let run = std::thread::spawn(move || run_server.run());
        (
            Self {
                server,
                run: Some(run),
            },
            rx,
        )
    }

    pub fn command(&self, target: u32, line: &str) {
        self.server
            .send_message(Message::with_text(mtype::LUA, 0, target, 0, line));
    }

    /// Stops the server and returns its exit code.
    pub fn finish(mut self) -> i32 {
        self.server.stop(0);
        self.run.take().unwrap().join().unwrap()
    }

    pub fn join(mut self) -> i32 {
        self.run.take().unwrap().join().unwrap()
    }
}

pub fn wait_for<F: FnMut(&Event) -> bool>(rx: &Receiver<Event>, mut pred: F) -> Event {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let left = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for event");
        let event = rx.recv_timeout(left).expect("timed out waiting for event");
        if pred(&event) {
            return event;
        }
    }
}

/// Asserts nothing matching arrives within `ms`.
pub fn assert_quiet<F: FnMut(&Event) -> bool>(rx: &Receiver<Event>, ms: u64, mut pred: F) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(event) => assert!(!pred(&event), "unexpected event: {event:?}"),
            Err(_) => return,
        }
    }
}

pub fn result_text(event: &Event) -> &str {
    match event {
        Event::Result(s) => s,
        other => panic!("expected result event, got {other:?}"),
    }
}

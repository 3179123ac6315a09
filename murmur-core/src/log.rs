//! Asynchronous line sink.
//!
//! Producers format one line and push it into a swap-on-read queue; a
//! dedicated writer thread drains the backlog wholesale, colors console
//! output by level and optionally appends to a log file. Errors are flushed
//! eagerly, everything else rides the batch flush.

use std::{
    cell::Cell,
    fmt,
    fs::File,
    io::Write as _,
    path::Path,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread::JoinHandle,
};

use crate::{error::AnyResult, queue::SwapQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "EROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DBUG",
        }
    }

    fn color(self) -> &'static str {
        match self {
            LogLevel::Error => "\x1b[31m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Info => "\x1b[37m",
            LogLevel::Debug => "\x1b[32m",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if s.eq_ignore_ascii_case("ERROR") {
            Ok(LogLevel::Error)
        } else if s.eq_ignore_ascii_case("WARN") {
            Ok(LogLevel::Warn)
        } else if s.eq_ignore_ascii_case("INFO") {
            Ok(LogLevel::Info)
        } else {
            Ok(LogLevel::Debug)
        }
    }
}

fn level_from(v: u8) -> LogLevel {
    match v {
        1 => LogLevel::Error,
        2 => LogLevel::Warn,
        3 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

const STATE_INIT: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct LogLine {
    console: bool,
    level: LogLevel,
    text: String,
}

struct LogInner {
    state: AtomicU8,
    level: AtomicU8,
    enable_stdout: AtomicU8,
    size: AtomicUsize,
    error_count: AtomicUsize,
    queue: SwapQueue<LogLine>,
    file: Mutex<Option<File>>,
}

pub struct Logger {
    inner: Arc<LogInner>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// The process-wide sink. The writer thread starts on first use and stays
/// parked in init state until [`Logger::init`] or [`Logger::ensure_ready`].
pub fn global() -> &'static Logger {
    static GLOBAL: OnceLock<Logger> = OnceLock::new();
    GLOBAL.get_or_init(Logger::start)
}

thread_local! {
    static CURRENT_SERVICE: Cell<u32> = const { Cell::new(0) };
    static THREAD_TAG: u32 = next_thread_tag();
}

fn next_thread_tag() -> u32 {
    static SEQ: AtomicUsize = AtomicUsize::new(1);
    SEQ.fetch_add(1, Ordering::Relaxed) as u32
}

/// Sets the service id stamped into log headers produced by this thread.
/// Workers set it around every dispatch; 0 falls back to the thread tag.
pub fn set_current_service(id: u32) {
    CURRENT_SERVICE.with(|c| c.set(id));
}

pub fn current_service() -> u32 {
    CURRENT_SERVICE.with(|c| c.get())
}

impl Logger {
    fn start() -> Self {
        let inner = Arc::new(LogInner {
            state: AtomicU8::new(STATE_INIT),
            level: AtomicU8::new(LogLevel::Debug as u8),
            enable_stdout: AtomicU8::new(1),
            size: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
            queue: SwapQueue::new(),
            file: Mutex::new(None),
        });
        let writer = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("murmur-log".into())
                .spawn(move || inner.write_loop())
                .expect("spawn log writer thread failed")
        };
        Self {
            inner,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Opens the log file (creating parent directories) and releases the
    /// writer. Startup aborts on failure, there is no fallback sink.
    pub fn init(&self, logfile: Option<&Path>) -> AnyResult<()> {
        if let Some(path) = logfile {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let fp = File::create(path)?;
            *self.inner.file.lock().unwrap() = Some(fp);
        }
        self.inner.state.store(STATE_READY, Ordering::Release);
        Ok(())
    }

    /// Transitions to ready without a file if `init` was never called.
    pub fn ensure_ready(&self) {
        let _ = self.inner.state.compare_exchange(
            STATE_INIT,
            STATE_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_READY
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self) -> LogLevel {
        level_from(self.inner.level.load(Ordering::Relaxed))
    }

    pub fn set_enable_stdout(&self, v: bool) {
        self.inner.enable_stdout.store(v as u8, Ordering::Relaxed);
    }

    /// Lines accepted but not yet written.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.inner.error_count.load(Ordering::Relaxed)
    }

    pub fn logfmt(&self, console: bool, level: LogLevel, args: fmt::Arguments<'_>) {
        if self.get_level() < level {
            return;
        }
        self.logstring(console, level, &args.to_string(), current_service());
    }

    pub fn logstring(&self, console: bool, level: LogLevel, msg: &str, serviceid: u32) {
        if self.get_level() < level {
            return;
        }
        if level == LogLevel::Error {
            self.inner.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let console = console && self.inner.enable_stdout.load(Ordering::Relaxed) != 0;

        let mut text = String::with_capacity(48 + msg.len());
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = fmt::Write::write_fmt(&mut text, format_args!("{stamp} {}", level.tag()));
        let tag_start = text.len();
        if serviceid == 0 {
            let tid = THREAD_TAG.with(|t| *t);
            let _ = fmt::Write::write_fmt(&mut text, format_args!("{tid}"));
        } else {
            let _ = fmt::Write::write_fmt(&mut text, format_args!(":{serviceid:08X}"));
        }
        while text.len() - tag_start < 9 {
            text.push(' ');
        }
        text.push_str("| ");
        text.push_str(msg);

        self.inner.queue.push(LogLine {
            console,
            level,
            text,
        });
        self.inner.size.fetch_add(1, Ordering::Relaxed);
    }

    /// Stops the writer after draining every queued line.
    pub fn wait(&self) {
        if self.inner.state.swap(STATE_STOPPED, Ordering::AcqRel) == STATE_STOPPED {
            return;
        }
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.inner.file.lock().unwrap() = None;
    }
}

impl LogInner {
    fn write_loop(&self) {
        while self.state.load(Ordering::Acquire) == STATE_INIT {
            std::thread::sleep(std::time::Duration::from_micros(50));
        }

        let mut backlog = Vec::new();
        let mut sleep_ns: u64 = 1;
        while self.state.load(Ordering::Acquire) == STATE_READY {
            self.queue.swap_into(&mut backlog);
            if backlog.is_empty() {
                std::thread::sleep(std::time::Duration::from_nanos(sleep_ns));
                sleep_ns = (sleep_ns << 1).min(1 << 24);
            } else {
                sleep_ns = 1;
                self.do_write(&mut backlog);
            }
        }

        self.queue.swap_into(&mut backlog);
        if !backlog.is_empty() {
            self.do_write(&mut backlog);
        }
    }

    fn do_write(&self, lines: &mut Vec<LogLine>) {
        let mut file = self.file.lock().unwrap();
        for line in lines.drain(..) {
            if line.console {
                if line.level == LogLevel::Error {
                    eprintln!("{}{}\x1b[0m", line.level.color(), line.text);
                } else {
                    println!("{}{}\x1b[0m", line.level.color(), line.text);
                }
            }
            if let Some(fp) = file.as_mut() {
                let _ = writeln!(fp, "{}", line.text);
                if line.level == LogLevel::Error {
                    let _ = fp.flush();
                }
            }
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(fp) = file.as_mut() {
            let _ = fp.flush();
        }
        let _ = std::io::stdout().flush();
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => {
        $crate::log::global().logfmt(true, $crate::log::LogLevel::Error, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => {
        $crate::log::global().logfmt(true, $crate::log::LogLevel::Warn, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => {
        $crate::log::global().logfmt(true, $crate::log::LogLevel::Info, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => {
        $crate::log::global().logfmt(true, $crate::log::LogLevel::Debug, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_defaults_to_debug() {
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("whatever".parse::<LogLevel>().unwrap(), LogLevel::Debug);
    }

    #[test]
    fn level_ordering_matches_severity() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }
}

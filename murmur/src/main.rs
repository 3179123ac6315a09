use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use clap::Parser;
use murmur_core::{
    log::{self, LogLevel},
    log_error, log_info,
    server::Server,
    BOOTSTRAP_ADDR,
};
use nix::sys::signal::{signal, SigHandler, Signal};

mod config;
mod trace;

use config::Config;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Init statement exposed to services as the STAT env entry
    #[clap(short = 'e', long = "stat")]
    stat: Option<String>,

    /// Path of the bootstrap config file
    #[clap(value_parser)]
    bootstrap: String,

    /// Extra arguments exposed to services as the ARG env entry
    #[clap(trailing_var_arg = true)]
    args: Vec<String>,
}

static SIGNAL_CODE: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(sig: nix::libc::c_int) {
    SIGNAL_CODE.store(sig, Ordering::Release);
}

fn register_signals() {
    unsafe {
        let _ = signal(Signal::SIGHUP, SigHandler::SigIgn);
        let _ = signal(Signal::SIGQUIT, SigHandler::SigIgn);
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_signal));
    }
}

/// Watches the signal flag from a plain thread and turns it into a server
/// stop; keeps the async-signal handler down to one atomic store.
fn spawn_signal_watcher(server: Arc<Server>) {
    std::thread::Builder::new()
        .name("murmur-signal".into())
        .spawn(move || loop {
            let code = SIGNAL_CODE.swap(0, Ordering::Acquire);
            if code != 0 {
                log_info!("Received signal {}, shutdown...", code);
                server.stop(code);
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        })
        .expect("spawn signal watcher failed");
}

fn run() -> i32 {
    let args = Args::parse();
    register_signals();

    let config = match Config::load(&args.bootstrap) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return -1;
        }
    };

    let sink = log::global();
    if let Some(level) = &config.loglevel {
        sink.set_level(level.parse().unwrap_or(LogLevel::Debug));
    }
    sink.set_enable_stdout(config.enable_stdout);
    if let Err(e) = sink.init(config.logfile.as_deref()) {
        eprintln!("ERROR: open log file failed: {e:#}");
        return -1;
    }
    trace::install();

    let threads = if config.thread > 0 {
        config.thread
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    };

    let mut services = config.services;
    if services.is_empty() {
        log_error!("no [[service]] entries in {}", args.bootstrap);
        return -1;
    }

    let server = Server::new(threads);
    murmur_services::register_all(&server);

    server.set_env(
        "ARG".to_string(),
        serde_json::to_string(&args.args).unwrap_or_default(),
    );
    server.set_env("THREAD_NUM".to_string(), threads.to_string());
    if let Some(stat) = &args.stat {
        server.set_env("STAT".to_string(), stat.clone());
    }

    server.init();
    spawn_signal_watcher(server.clone());

    let mut bootstrap = services.remove(0);
    if bootstrap.name.is_empty() {
        bootstrap.name = "bootstrap".to_string();
    }
    bootstrap.threadid = 1;
    bootstrap.opt_service_id = BOOTSTRAP_ADDR;
    server.set_unique_service(bootstrap.name.clone(), BOOTSTRAP_ADDR);
    server.new_service(bootstrap);
    for conf in services {
        server.new_service(conf);
    }

    let exitcode = server.run();
    log_info!("STOP");
    exitcode
}

fn main() {
    let exitcode = run();
    log::global().wait();
    std::process::exit(exitcode);
}

use std::future::Future;

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};

/// Per-worker runtime: io_uring where the kernel supports it, epoll/kqueue
/// otherwise. Timers are always enabled, connection deadlines and the
/// socket sweep depend on them.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl Default for RuntimeWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeWrapper {
    pub fn new() -> Self {
        #[cfg(target_os = "linux")]
        if monoio::utils::detect_uring() {
            let runtime = RuntimeBuilder::<IoUringDriver>::new()
                .enable_timer()
                .build()
                .expect("build io_uring runtime failed");
            return RuntimeWrapper::IoUring(runtime);
        }

        let runtime = RuntimeBuilder::<LegacyDriver>::new()
            .enable_timer()
            .build()
            .expect("build legacy runtime failed");
        RuntimeWrapper::Legacy(runtime)
    }

    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}

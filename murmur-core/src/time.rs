//! Process time source.
//!
//! Wall time is anchored once at startup and advanced by the monotonic
//! clock, so `now_ms` can never step backwards under NTP adjustments.
//! Artificial skew (`adjtime`) is owned by the server, not this module.

use std::{
    sync::OnceLock,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

fn origin() -> &'static (i64, Instant) {
    static ORIGIN: OnceLock<(i64, Instant)> = OnceLock::new();
    ORIGIN.get_or_init(|| {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        (wall, Instant::now())
    })
}

/// Anchors the time origin. Idempotent; called once from server init.
pub fn init() {
    let _ = origin();
}

/// Milliseconds since the unix epoch, monotonic after process start.
pub fn wall_now_ms() -> i64 {
    let (base, start) = origin();
    base + start.elapsed().as_millis() as i64
}

/// Monotonic seconds since process start. Used for cpu accounting.
pub fn clock() -> f64 {
    origin().1.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_monotonic() {
        let a = wall_now_ms();
        let b = wall_now_ms();
        assert!(b >= a);
    }

    #[test]
    fn clock_advances() {
        let a = clock();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(clock() > a);
    }
}

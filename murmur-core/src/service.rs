//! Service trait, configuration and per-service accounting.

use std::{cell::Cell, rc::Rc};

use serde::Deserialize;

use crate::{context::ServiceContext, error::AnyResult, log_warn, message::Message};

/// An addressable message handler, pinned to one worker for its lifetime.
///
/// `dispatch` runs synchronously on the owning worker thread and must not
/// block; asynchronous waits are modeled as runtime requests whose
/// completion arrives later as a new message with the matching session.
/// The message must not be retained beyond the call, but it may be mutated
/// to redirect it (change `receiver` and `mtype`), in which case the worker
/// re-submits it after the handler returns.
pub trait Service {
    /// Bootstraps the service on its worker thread. Returning an error
    /// aborts the creation; a failing bootstrap service stops the server.
    fn init(&mut self, ctx: &ServiceContext, conf: &ServiceConf) -> AnyResult<()>;

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message);
}

/// Factory registered per service type at startup.
pub type ServiceFactory = fn() -> Box<dyn Service>;

/// Creation parameters handed to [`Server::new_service`](crate::server::Server::new_service).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConf {
    /// Registered service type name.
    #[serde(rename = "type")]
    pub stype: String,
    #[serde(default)]
    pub name: String,
    /// At most one service with this name may exist process-wide.
    #[serde(default)]
    pub unique: bool,
    /// Pins the service to a worker; 0 lets the router pick one.
    #[serde(default)]
    pub threadid: u32,
    /// Memory cap in bytes; 0 means unlimited.
    #[serde(default)]
    pub memlimit: usize,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub params: String,
    #[serde(skip)]
    pub creator: u32,
    #[serde(skip)]
    pub session: i64,
    #[serde(skip)]
    pub opt_service_id: u32,
}

const MEM_REPORT_START: usize = 8 * 1024 * 1024;

/// Byte accounting for a memory-limited service.
///
/// Service implementations route their payload allocations through
/// [`try_charge`](MemoryMeter::try_charge); a refusal is a soft failure the
/// in-flight operation reports back to its caller. Crossing the doubling
/// report threshold logs a warning.
#[derive(Debug)]
pub struct MemoryMeter {
    used: Cell<usize>,
    limit: usize,
    report: Cell<usize>,
}

impl MemoryMeter {
    pub fn new(limit: usize) -> Self {
        Self {
            used: Cell::new(0),
            limit,
            report: Cell::new(MEM_REPORT_START),
        }
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Attributes `n` bytes to the service. Refuses past the limit.
    pub fn try_charge(&self, n: usize, owner: &str) -> bool {
        let next = self.used.get().saturating_add(n);
        if self.limit != 0 && next > self.limit {
            log_warn!(
                "{} memory refused: current {:.2} MB, limit {:.2} MB",
                owner,
                next as f64 / (1024.0 * 1024.0),
                self.limit as f64 / (1024.0 * 1024.0)
            );
            return false;
        }
        self.used.set(next);
        if next > self.report.get() {
            self.report.set(self.report.get().saturating_mul(2));
            log_warn!(
                "{} memory usage reached {:.2} MB",
                owner,
                next as f64 / (1024.0 * 1024.0)
            );
        }
        true
    }

    pub fn discharge(&self, n: usize) {
        self.used.set(self.used.get().saturating_sub(n));
    }
}

/// Bookkeeping shared between a worker's service table and the
/// [`ServiceContext`] handed into the running handler.
#[derive(Debug)]
pub struct ServiceMeta {
    pub id: u32,
    pub name: String,
    pub unique: bool,
    ok: Cell<bool>,
    cpu: Cell<f64>,
    next_seq: Cell<i64>,
    pub mem: MemoryMeter,
}

impl ServiceMeta {
    pub fn new(id: u32, name: String, unique: bool, memlimit: usize) -> Rc<Self> {
        Rc::new(Self {
            id,
            name,
            unique,
            ok: Cell::new(false),
            cpu: Cell::new(0.0),
            next_seq: Cell::new(0),
            mem: MemoryMeter::new(memlimit),
        })
    }

    pub fn ok(&self) -> bool {
        self.ok.get()
    }

    pub fn set_ok(&self, v: bool) {
        self.ok.set(v);
    }

    pub fn add_cpu(&self, v: f64) {
        self.cpu.set(self.cpu.get() + v);
    }

    /// Drains the accumulated cpu seconds.
    pub fn take_cpu(&self) -> f64 {
        self.cpu.replace(0.0)
    }

    /// Next session / timer sequence value, positive and unique within this
    /// service's lifetime.
    pub fn next_sequence(&self) -> i64 {
        let v = self.next_seq.get() + 1;
        self.next_seq.set(v);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_refuses_past_limit() {
        let m = MemoryMeter::new(100);
        assert!(m.try_charge(60, "svc"));
        assert!(!m.try_charge(50, "svc"));
        assert_eq!(m.used(), 60);
        m.discharge(10);
        assert!(m.try_charge(50, "svc"));
        assert_eq!(m.used(), 100);
    }

    #[test]
    fn meter_unlimited_when_zero() {
        let m = MemoryMeter::new(0);
        assert!(m.try_charge(usize::MAX / 2, "svc"));
        assert!(m.try_charge(usize::MAX / 2, "svc"));
    }

    #[test]
    fn sequences_are_positive_and_increasing() {
        let meta = ServiceMeta::new(0x0100_0001, "s".into(), false, 0);
        let a = meta.next_sequence();
        let b = meta.next_sequence();
        assert!(a > 0 && b > a);
    }
}

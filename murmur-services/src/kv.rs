//! Key-value service, normally deployed unique.
//!
//! Speaks a tiny text protocol over LUA/TEXT messages: `SET key value`,
//! `GET key`, `DEL key`. Stored bytes are charged to the service's memory
//! meter, so a capped instance starts refusing SETs instead of growing.

use std::collections::HashMap;

use murmur_core::{
    context::ServiceContext,
    message::{mtype, Message},
    service::{MemoryMeter, Service, ServiceConf},
    AnyResult,
};

#[derive(Default)]
pub struct KvService {
    entries: HashMap<String, String>,
}

pub fn make() -> Box<dyn Service> {
    Box::<KvService>::default()
}

impl KvService {
    fn apply(&mut self, mem: &MemoryMeter, owner: &str, request: &str) -> Result<String, String> {
        let mut parts = request.splitn(3, ' ');
        let verb = parts.next().unwrap_or_default();
        match verb {
            "SET" => {
                let key = parts.next().ok_or("SET needs a key")?;
                let value = parts.next().unwrap_or_default();
                let cost = key.len() + value.len();
                if !mem.try_charge(cost, owner) {
                    return Err("out of memory".to_string());
                }
                if let Some(old) = self.entries.insert(key.to_string(), value.to_string()) {
                    mem.discharge(key.len() + old.len());
                }
                Ok("OK".to_string())
            }
            "GET" => {
                let key = parts.next().ok_or("GET needs a key")?;
                Ok(self.entries.get(key).cloned().unwrap_or_default())
            }
            "DEL" => {
                let key = parts.next().ok_or("DEL needs a key")?;
                match self.entries.remove(key) {
                    Some(old) => {
                        mem.discharge(key.len() + old.len());
                        Ok("OK".to_string())
                    }
                    None => Ok(String::new()),
                }
            }
            other => Err(format!("unknown verb {other:?}")),
        }
    }
}

impl Service for KvService {
    fn init(&mut self, _ctx: &ServiceContext, conf: &ServiceConf) -> AnyResult<()> {
        tracing::debug!("kv service {} starting", conf.name);
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        match msg.mtype {
            mtype::LUA | mtype::TEXT => {
                if msg.session == 0 || msg.sender == 0 {
                    return;
                }
                let request = String::from_utf8_lossy(msg.data()).to_string();
                match self.apply(ctx.mem(), ctx.name(), &request) {
                    Ok(reply) => {
                        ctx.send_text(msg.sender, mtype::TEXT, &reply, msg.session);
                    }
                    Err(reason) => {
                        ctx.send_text(msg.sender, mtype::ERROR, &reason, msg.session);
                    }
                }
            }
            mtype::SHUTDOWN => ctx.quit(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del() {
        let mem = MemoryMeter::new(0);
        let mut kv = KvService::default();
        assert_eq!(kv.apply(&mem, "kv", "SET city lisbon"), Ok("OK".into()));
        assert_eq!(kv.apply(&mem, "kv", "GET city"), Ok("lisbon".into()));
        assert_eq!(kv.apply(&mem, "kv", "DEL city"), Ok("OK".into()));
        assert_eq!(kv.apply(&mem, "kv", "GET city"), Ok(String::new()));
        assert_eq!(mem.used(), 0);
    }

    #[test]
    fn capped_instance_refuses_sets() {
        let mem = MemoryMeter::new(16);
        let mut kv = KvService::default();
        assert!(kv.apply(&mem, "kv", "SET k short").is_ok());
        assert_eq!(
            kv.apply(&mem, "kv", "SET another muchlongervalue"),
            Err("out of memory".into())
        );
        // the refused SET must not leak accounting
        assert_eq!(mem.used(), "k".len() + "short".len());
    }

    #[test]
    fn overwrites_release_the_old_value() {
        let mem = MemoryMeter::new(0);
        let mut kv = KvService::default();
        kv.apply(&mem, "kv", "SET k aaaa").unwrap();
        kv.apply(&mem, "kv", "SET k bb").unwrap();
        assert_eq!(mem.used(), "k".len() + "bb".len());
        assert_eq!(kv.apply(&mem, "kv", "GET k"), Ok("bb".into()));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let mem = MemoryMeter::new(0);
        let mut kv = KvService::default();
        assert!(kv.apply(&mem, "kv", "SET").is_err());
        assert!(kv.apply(&mem, "kv", "NOPE x").is_err());
    }
}

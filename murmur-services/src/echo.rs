//! Echo service: replies to every request with its own payload.

use murmur_core::{
    buffer::Buffer,
    context::ServiceContext,
    message::{mtype, Message},
    service::{Service, ServiceConf},
    AnyResult,
};

#[derive(Default)]
pub struct EchoService;

pub fn make() -> Box<dyn Service> {
    Box::new(EchoService)
}

impl Service for EchoService {
    fn init(&mut self, _ctx: &ServiceContext, conf: &ServiceConf) -> AnyResult<()> {
        tracing::debug!("echo service {} starting", conf.name);
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        match msg.mtype {
            mtype::LUA | mtype::TEXT => {
                if msg.session != 0 && msg.sender != 0 {
                    ctx.send(
                        msg.sender,
                        msg.mtype,
                        Buffer::from_slice(msg.data()),
                        msg.session,
                    );
                }
            }
            mtype::SHUTDOWN => ctx.quit(),
            _ => {}
        }
    }
}

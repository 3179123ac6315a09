//! TCP gate service: listens with a configurable protocol, accepts
//! continuously and echoes every payload back to the peer. Exercises the
//! whole socket surface and doubles as the integration-test fixture.

use murmur_core::{
    buffer::BufferFlag,
    context::{ReadResult, ServiceContext},
    message::{mtype, Message, Payload},
    net::SocketProtocol,
    service::{Service, ServiceConf},
    AnyResult,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct GateConf {
    host: String,
    port: u16,
    protocol: String,
    #[serde(default)]
    timeout: u64,
    #[serde(default)]
    nodelay: bool,
}

pub struct GateService {
    conf: Option<GateConf>,
    protocol: SocketProtocol,
    listen_fd: u32,
}

pub fn make() -> Box<dyn Service> {
    Box::new(GateService {
        conf: None,
        protocol: SocketProtocol::Stream,
        listen_fd: 0,
    })
}

impl GateService {
    /// Drains directly-available line reads; stops as soon as one goes
    /// pending.
    fn pump_stream(&self, ctx: &ServiceContext, fd: u32) {
        loop {
            match ctx.read(fd, 0, "\n") {
                ReadResult::Data(line) => {
                    if !ctx.write(fd, line) {
                        return;
                    }
                }
                ReadResult::Pending(_) => return,
                ReadResult::Failed(reason) => {
                    tracing::debug!("gate read on {fd} failed: {reason}");
                    return;
                }
            }
        }
    }
}

impl Service for GateService {
    fn init(&mut self, ctx: &ServiceContext, conf: &ServiceConf) -> AnyResult<()> {
        let gate: GateConf = serde_json::from_str(&conf.params)?;
        self.protocol = gate.protocol.parse()?;
        let (fd, addr) = ctx.listen(&gate.host, gate.port, self.protocol)?;
        self.listen_fd = fd;
        ctx.set_env(&format!("{}_ADDRESS", conf.name), &addr.to_string());
        ctx.accept(fd, ctx.id(), 0);
        tracing::info!("gate {} listening on {addr}", conf.name);
        self.conf = Some(gate);
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: &mut Message) {
        match msg.mtype {
            mtype::SOCKET_ACCEPT => {
                let fd = msg.sender;
                if let Some(gate) = &self.conf {
                    if gate.nodelay {
                        ctx.setnodelay(fd);
                    }
                    if gate.timeout > 0 {
                        ctx.settimeout(fd, gate.timeout);
                    }
                }
                if self.protocol == SocketProtocol::Stream {
                    self.pump_stream(ctx, fd);
                }
            }
            mtype::SOCKET_RECV => {
                let fd = msg.sender;
                let Payload::Bytes(data) = std::mem::take(&mut msg.payload) else {
                    return;
                };
                if data.has_flag(BufferFlag::WsPing) || data.has_flag(BufferFlag::WsPong) {
                    return;
                }
                let mask = if data.has_flag(BufferFlag::WsText) {
                    BufferFlag::WsText as u8
                } else {
                    0
                };
                if ctx.write_mask(fd, data, mask) && self.protocol == SocketProtocol::Stream {
                    self.pump_stream(ctx, fd);
                }
            }
            mtype::SOCKET_CLOSE | mtype::SOCKET_ERROR => {
                tracing::debug!(
                    "gate socket {} ended: {}",
                    msg.sender,
                    String::from_utf8_lossy(msg.data())
                );
            }
            mtype::SHUTDOWN => {
                if self.listen_fd != 0 {
                    ctx.close(self.listen_fd);
                }
                ctx.quit();
            }
            _ => {}
        }
    }
}

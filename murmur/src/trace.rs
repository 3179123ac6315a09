//! Bridges `tracing` events from dependencies into the runtime's log sink,
//! so everything ends up in one ordered stream with the same headers.

use std::fmt::Write as _;

use murmur_core::log::{self, LogLevel};
use tracing::{field::Field, Event, Level, Subscriber};
use tracing_subscriber::{layer::Context, prelude::*, registry::Registry, Layer};

struct SinkLayer;

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = match *event.metadata().level() {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        };
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        log::global().logstring(true, level, &visitor.0, log::current_service());
    }
}

pub fn install() {
    let _ = Registry::default().with(SinkLayer).try_init();
}

//! Built-in service implementations for the murmur runtime.
//!
//! These are the reference message handlers used by the stock binary and
//! the integration tests: a plain echo responder, a unique key-value
//! service and a TCP gate exposing the socket subsystem.

use std::sync::Arc;

use murmur_core::server::Server;

pub mod echo;
pub mod gate;
pub mod kv;

/// Registers every built-in service type on a freshly built server.
pub fn register_all(server: &Arc<Server>) {
    server.register_service("echo", echo::make);
    server.register_service("kv", kv::make);
    server.register_service("gate", gate::make);
}

// Proxy
//
// The request-lifecycle engine (engine), the HTTP surface for metered and
// admin traffic (server, admin), and the wiring between them.

pub mod admin;
pub mod engine;
pub mod server;

pub use engine::ProxyEngine;
pub use server::run_server;

pub mod client;
pub mod config;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod tls;

//! The front-facing HTTP/1 listener: accepts connections, parses requests,
//! and hands each one to a `ferry_core::LoadBalancer`.

mod connection;
mod request;
mod server;
mod timeouts;

pub use connection::{handle_connection, ClientStream};
pub use server::Server;

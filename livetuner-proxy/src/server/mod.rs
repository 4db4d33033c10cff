//! Raw TCP fan-out server.

pub mod listener;

pub use listener::{Server, ServerConfig};

//! The echo protocol: the wire message and the completion handlers of
//! both roles.

pub mod message;

mod client;
mod server;

pub use self::client::{ClientEvent, ClientHandler};
pub use self::server::{ServerHandler, ServerStats};

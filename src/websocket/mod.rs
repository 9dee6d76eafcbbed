//! WebSocket transport: upgrade, per-connection reader/writer tasks and
//! the client/control wire messages.

mod handler;
mod message;

pub use handler::{ws_handler, WsQuery};
pub use message::{ClientMessage, ControlMessage, OutboundMessage};

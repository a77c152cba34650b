//! Transport layer for worker connections.

pub mod framing;
pub mod ws;

pub use ws::ws_handler;

//! Binary IPC surface for IDE-side helpers: framed protocol, local socket
//! server and the bridge onto the bus.

pub mod bridge;
pub mod capabilities;
pub mod protocol;
pub mod server;

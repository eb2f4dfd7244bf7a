//! Network Layer
//!
//! WebSocket transport around the session core. Frames are opaque text;
//! turn decisions are made in `session/`.

pub mod protocol;
pub mod server;

pub use protocol::{Inbound, Outbound};
pub use server::{RelayConfig, RelayError, RelayServer};

//! # Turn Relay
//!
//! Real-time relay for a strictly two-party, turn-based exchange.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TURN RELAY                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  session/        - Session core (transport-agnostic)         │
//! │  ├── registry.rs - Admission and participant identities      │
//! │  └── relay.rs    - Turn marker and move forwarding           │
//! │                                                              │
//! │  network/        - WebSocket transport                       │
//! │  ├── server.rs   - Listener, handshake, connection tasks     │
//! │  └── protocol.rs - Frame types and decoding policy           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Turn Guarantee
//!
//! Only the participant holding the turn has moves forwarded. Every accepted
//! move flips the turn, whether or not the peer was there to receive it.
//! Payloads are relayed verbatim and never interpreted.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod session;

// Re-export commonly used types
pub use network::server::{RelayConfig, RelayError, RelayServer};
pub use session::registry::ParticipantId;
pub use session::relay::{MoveOutcome, SessionManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

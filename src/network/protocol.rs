//! Protocol Frames
//!
//! Transport-neutral frame types exchanged between the relay core and the
//! WebSocket layer. Move payloads are opaque UTF-8 text; the relay never
//! inspects them.

use std::borrow::Cow;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Close code for a normal closure (RFC 6455 §7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;

/// Close reason sent when a participant's close frame is answered.
pub const CLOSE_REASON_ACK: &str = "Closing";

/// Close reason sent to every participant on server shutdown.
pub const CLOSE_REASON_SHUTDOWN: &str = "Server shutting down";

// =============================================================================
// SERVER -> CLIENT FRAMES
// =============================================================================

/// A frame queued by the relay for delivery to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Forwarded move, delivered verbatim.
    Text(String),

    /// Graceful close with the given code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

impl Outbound {
    /// Normal-closure frame with a reason.
    pub fn close(reason: &str) -> Self {
        Self::Close {
            code: CLOSE_NORMAL,
            reason: reason.to_string(),
        }
    }

    /// Is this a close frame.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close { .. })
    }

    /// Convert to a WebSocket message.
    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason),
            })),
        }
    }
}

// =============================================================================
// CLIENT -> SERVER FRAMES
// =============================================================================

/// Inbound frame after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A move to arbitrate.
    Move(String),

    /// Peer asked to close; carries the code to echo back.
    Close(u16),

    /// Payload that was not valid UTF-8.
    Malformed,

    /// Control traffic the relay does not act on.
    Ignored,
}

impl Inbound {
    /// Decode a WebSocket message.
    ///
    /// Binary frames carrying valid UTF-8 are treated as moves. A close frame
    /// without a code is answered with a normal closure.
    pub fn from_message(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Self::Move(text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => Self::Move(text),
                Err(_) => Self::Malformed,
            },
            Message::Close(frame) => Self::Close(
                frame
                    .map(|f| u16::from(f.code))
                    .unwrap_or(CLOSE_NORMAL),
            ),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Self::Ignored,
        }
    }
}

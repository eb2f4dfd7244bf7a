//! Session Core
//!
//! Connection admission, participant identities, and turn arbitration.
//! Transport-agnostic: connections are represented by their outbound queue.

pub mod registry;
pub mod relay;

pub use registry::{ConnectionId, ConnectionRegistry, ConnectionState, ParticipantId, MAX_PARTICIPANTS};
pub use relay::{Admission, MoveOutcome, SessionError, SessionManager};

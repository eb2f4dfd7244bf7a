//! Connection Registry
//!
//! Admission control and identity bookkeeping for the two participant slots.
//! Uses BTreeMap for deterministic iteration order.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::mpsc;

use crate::network::protocol::Outbound;

/// Maximum number of simultaneously registered connections.
pub const MAX_PARTICIPANTS: usize = 2;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Opaque connection handle key (UUID v4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the exchange a connection represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParticipantId {
    /// First participant; moves first.
    One,
    /// Second participant.
    Two,
}

impl ParticipantId {
    /// Numeric identity (1 or 2).
    pub const fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    /// Identity for a slot number, if in range.
    pub const fn from_number(n: usize) -> Option<Self> {
        match n {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }

    /// The opposing participant.
    pub const fn other(self) -> Self {
        match self {
            Self::One => Self::Two,
            Self::Two => Self::One,
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

// =============================================================================
// ENTRIES
// =============================================================================

/// Per-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting and forwarding moves.
    Open,
    /// Close handshake in progress; no longer a forwarding target.
    Closing,
    /// Close handshake done and entry released.
    Closed,
}

/// A registered connection.
#[derive(Debug)]
pub struct RegistryEntry {
    /// Assigned identity.
    pub participant: ParticipantId,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Bounded queue drained by the connection's writer task.
    pub outbound: mpsc::Sender<Outbound>,
}

impl RegistryEntry {
    /// Can frames still be delivered to this connection.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && !self.outbound.is_closed()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Mapping from connection handle to participant identity.
///
/// Not synchronized on its own; the session manager guards it together with
/// the turn marker so every operation is linearizable.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: BTreeMap<ConnectionId, RegistryEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection if a slot is free.
    ///
    /// The identity is `len + 1`. After participant 1 leaves while 2 stays
    /// that slot is still taken, so the remaining free slot is used instead.
    /// This deliberately departs from plain `len + 1`: identities must stay
    /// unique among live connections.
    pub fn try_admit(
        &mut self,
        conn: ConnectionId,
        outbound: mpsc::Sender<Outbound>,
    ) -> Option<ParticipantId> {
        if self.entries.len() >= MAX_PARTICIPANTS || self.entries.contains_key(&conn) {
            return None;
        }

        let preferred = ParticipantId::from_number(self.entries.len() + 1)?;
        let participant = if self.is_taken(preferred) {
            preferred.other()
        } else {
            preferred
        };

        self.entries.insert(conn, RegistryEntry {
            participant,
            state: ConnectionState::Open,
            outbound,
        });

        Some(participant)
    }

    /// Remove a connection. Absent handles are a no-op.
    pub fn remove(&mut self, conn: &ConnectionId) -> Option<ParticipantId> {
        self.entries.remove(conn).map(|e| e.participant)
    }

    /// Move a connection to `Closing`. Returns false if not registered.
    pub fn mark_closing(&mut self, conn: &ConnectionId) -> bool {
        match self.entries.get_mut(conn) {
            Some(entry) => {
                entry.state = ConnectionState::Closing;
                true
            }
            None => false,
        }
    }

    /// The entry whose identity differs from `participant`.
    pub fn other_than(&self, participant: ParticipantId) -> Option<(&ConnectionId, &RegistryEntry)> {
        self.entries.iter().find(|(_, e)| e.participant != participant)
    }

    /// Look up an entry.
    pub fn get(&self, conn: &ConnectionId) -> Option<&RegistryEntry> {
        self.entries.get(conn)
    }

    /// Every registered handle with its queue.
    pub fn all_handles(&self) -> impl Iterator<Item = (&ConnectionId, &RegistryEntry)> {
        self.entries.iter()
    }

    /// Is an identity currently held.
    pub fn is_taken(&self, participant: ParticipantId) -> bool {
        self.entries.values().any(|e| e.participant == participant)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the registry empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Are both slots taken.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_PARTICIPANTS
    }
}

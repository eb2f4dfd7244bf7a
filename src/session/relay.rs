//! Turn-Arbitration Relay
//!
//! Owns the connection registry and the turn marker behind one lock. Every
//! admission, removal, and move is arbitrated here so the `size <= 2`
//! invariant and the turn order hold under concurrent connection tasks.

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::network::protocol::Outbound;
use crate::session::registry::{ConnectionId, ConnectionRegistry, ParticipantId};

/// Successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Registry key for the new connection.
    pub conn: ConnectionId,
    /// Assigned identity.
    pub participant: ParticipantId,
}

/// What happened to a received move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Sender did not hold the turn; dropped, marker unchanged.
    OutOfTurn {
        /// Whose turn it is.
        expected: ParticipantId,
    },
    /// Queued for the peer; marker advanced.
    Forwarded {
        /// Receiving participant.
        to: ParticipantId,
    },
    /// Accepted but nobody could receive it; marker advanced.
    Undelivered,
}

impl MoveOutcome {
    /// Did the move advance the turn marker.
    pub fn advanced_turn(&self) -> bool {
        !matches!(self, Self::OutOfTurn { .. })
    }
}

/// Session errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Both participant slots are taken.
    #[error("Session is full")]
    SessionFull,
}

/// State guarded by the session lock.
#[derive(Debug)]
struct SessionInner {
    registry: ConnectionRegistry,
    turn: ParticipantId,
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// The single two-party session.
///
/// Constructed once per server and shared with every connection task.
#[derive(Debug)]
pub struct SessionManager {
    inner: RwLock<SessionInner>,
}

impl SessionManager {
    /// Create a session with an empty registry; participant 1 moves first.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SessionInner {
                registry: ConnectionRegistry::new(),
                turn: ParticipantId::One,
            }),
        }
    }

    /// Admit a connection if a slot is free.
    ///
    /// The capacity check and insert happen under one write lock.
    pub async fn try_admit(&self, outbound: mpsc::Sender<Outbound>) -> Result<Admission, SessionError> {
        let conn = ConnectionId::new();
        let mut inner = self.inner.write().await;

        match inner.registry.try_admit(conn, outbound) {
            Some(participant) => {
                info!("Participant {} connected ({})", participant, conn);
                Ok(Admission { conn, participant })
            }
            None => {
                warn!("Server full. New connection denied.");
                Err(SessionError::SessionFull)
            }
        }
    }

    /// Mark a connection as closing so it stops receiving forwards.
    pub async fn mark_closing(&self, conn: &ConnectionId) -> bool {
        self.inner.write().await.registry.mark_closing(conn)
    }

    /// Release a connection's slot. Idempotent.
    ///
    /// The turn marker is left untouched.
    pub async fn remove(&self, conn: &ConnectionId) -> Option<ParticipantId> {
        let removed = self.inner.write().await.registry.remove(conn);
        if let Some(participant) = removed {
            info!("Participant {} disconnected", participant);
        }
        removed
    }

    /// Arbitrate a move from `sender`.
    ///
    /// Turn check, peer lookup, enqueue, and turn advance are one critical
    /// section: the peer cannot reply before the marker has flipped.
    pub async fn handle_frame(&self, sender: ParticipantId, text: String) -> MoveOutcome {
        let mut inner = self.inner.write().await;
        info!("Participant {} made a move: {}", sender, text);

        if inner.turn != sender {
            info!("Invalid turn for participant {}. Ignoring move.", sender);
            return MoveOutcome::OutOfTurn { expected: inner.turn };
        }

        let outcome = match inner.registry.other_than(sender) {
            Some((_, peer)) if peer.is_open() => {
                let to = peer.participant;
                match peer.outbound.try_send(Outbound::Text(text)) {
                    Ok(()) => {
                        info!("Move forwarded to participant {}", to);
                        MoveOutcome::Forwarded { to }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Outbound queue for participant {} is full, move not delivered", to);
                        MoveOutcome::Undelivered
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Participant {} queue closed, move not delivered", to);
                        MoveOutcome::Undelivered
                    }
                }
            }
            _ => {
                debug!("No open peer for participant {}, move not delivered", sender);
                MoveOutcome::Undelivered
            }
        };

        inner.turn = sender.other();
        outcome
    }

    /// Queue a graceful close on every registered connection.
    ///
    /// Connections whose queue is already gone are skipped. Returns the
    /// number of close frames queued.
    pub async fn close_all(&self, reason: &str) -> usize {
        let inner = self.inner.read().await;
        let mut queued = 0;
        for (conn, entry) in inner.registry.all_handles() {
            match entry.outbound.try_send(Outbound::close(reason)) {
                Ok(()) => queued += 1,
                Err(e) => debug!("Skipping close for {}: {}", conn, e),
            }
        }
        queued
    }

    /// Whose turn it is.
    pub async fn turn(&self) -> ParticipantId {
        self.inner.read().await.turn
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.registry.len()
    }

    /// Identities currently held.
    pub async fn participants(&self) -> Vec<ParticipantId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<_> = inner.registry.all_handles().map(|(_, e)| e.participant).collect();
        ids.sort();
        ids
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

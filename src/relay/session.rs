//! # Relay Session
//!
//! A session is a named room: one host, an ordered list of members, and a
//! lifecycle flag. Sessions only live inside the [`SessionRegistry`]; everything
//! outside of it sees cloned snapshots.
//!
//! ## Session Lifecycle:
//! 1. **Active**: Created by `create-session` or the create-on-join fallback
//! 2. **Closing**: The host closed the session; removal is scheduled after a grace period
//! 3. **Removed**: The entry is gone from the registry (there is no stored variant for it)
//!
//! [`SessionRegistry`]: crate::relay::registry::SessionRegistry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Caller-supplied opaque session identifier.
pub type SessionId = String;

/// Source of generation numbers. Every session incarnation gets a fresh one so a
/// delayed removal can tell "the session I closed" apart from a newer session that
/// happens to reuse the same id.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of one live WebSocket link.
///
/// ## Rust Concepts:
/// - **Newtype**: Wrapping `Uuid` keeps connection ids from being mixed up with other UUIDs
/// - **#[serde(transparent)]**: Serializes as the bare UUID string on the wire
/// - **Copy**: 16 bytes, cheap to pass around by value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting members and relaying audio
    Active,
    /// Closed by the host, waiting out the grace period before removal
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Closing => "closing",
        }
    }
}

/// Result of removing a member from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Set when the departing member was the host and someone else took over
    pub new_host: Option<ConnectionId>,
}

/// A shared audio room.
///
/// Members are kept in join order. That order is what makes host reassignment
/// deterministic: the longest-standing remaining member takes over.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    host: ConnectionId,
    members: Vec<ConnectionId>,
    state: SessionState,
    created_at: DateTime<Utc>,
    generation: u64,
}

impl Session {
    /// Create a new `Active` session whose only member is `host`.
    pub fn new(id: impl Into<SessionId>, host: ConnectionId) -> Self {
        Self {
            id: id.into(),
            host,
            members: vec![host],
            state: SessionState::Active,
            created_at: Utc::now(),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn host(&self) -> ConnectionId {
        self.host
    }

    pub fn members(&self) -> &[ConnectionId] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_member(&self, conn: ConnectionId) -> bool {
        self.members.contains(&conn)
    }

    pub fn is_host(&self, conn: ConnectionId) -> bool {
        self.host == conn
    }

    /// Every member except `conn`, in join order.
    pub fn peers_of(&self, conn: ConnectionId) -> Vec<ConnectionId> {
        self.members.iter().copied().filter(|m| *m != conn).collect()
    }

    /// Add `conn` to the member list.
    ///
    /// Returns `false` if it was already a member; membership never holds duplicates.
    pub fn add_member(&mut self, conn: ConnectionId) -> bool {
        if self.is_member(conn) {
            return false;
        }
        self.members.push(conn);
        true
    }

    /// Remove `conn` and reassign the host if needed.
    ///
    /// ## Host Reassignment:
    /// If the host leaves and anyone remains, the first remaining member (the one
    /// that joined earliest) becomes host. If nobody remains the host field is left
    /// alone; the registry drops empty sessions before anyone can observe it.
    ///
    /// Returns `None` when `conn` was not a member.
    pub fn remove_member(&mut self, conn: ConnectionId) -> Option<Departure> {
        let position = self.members.iter().position(|m| *m == conn)?;
        self.members.remove(position);

        let new_host = match self.members.first() {
            Some(next) if self.host == conn => {
                self.host = *next;
                Some(*next)
            }
            _ => None,
        };

        Some(Departure { new_host })
    }

    /// Transition `Active → Closing`. Returns `false` if already closing.
    pub fn begin_closing(&mut self) -> bool {
        if self.state == SessionState::Closing {
            return false;
        }
        self.state = SessionState::Closing;
        true
    }

    /// Point-in-time summary for diagnostics.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            member_count: self.members.len(),
            host: self.host,
            active: self.is_active(),
            created_at: self.created_at,
        }
    }
}

/// Diagnostic view of one session, as returned by the listing endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub member_count: usize,
    pub host: ConnectionId,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

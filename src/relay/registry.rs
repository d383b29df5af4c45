//! # Session Registry
//!
//! The in-memory session table. Every mutation for a given session id runs while
//! holding that id's map entry, so two connections racing to create the same id,
//! or a `leave` racing a `disconnect`, always see one consistent order of effects.
//!
//! ## Concurrency:
//! - Backed by `DashMap`, which shards the table and locks per shard
//! - Sessions with different ids never wait on one global lock
//! - Critical sections are synchronous and short; no I/O happens while an entry is held
//!
//! ## Empty-session rule:
//! [`SessionRegistry::mutate`] removes the entry in the same critical section when a
//! transition leaves it without members, so nobody can observe an empty session.

use crate::relay::session::{ConnectionId, Session, SessionId, SessionState, SessionSummary};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Outcome of [`SessionRegistry::join_or_create`].
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// The id was unknown and a new session was created with the caller as host
    Created(Session),
    /// The caller was added to an existing active session
    Joined(Session),
    /// The caller was already a member; nothing changed
    AlreadyMember(Session),
    /// The session exists but is closing
    Closing,
    /// The id is unknown and creation was not allowed
    NotFound,
}

/// Result of a transition applied through [`SessionRegistry::mutate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<R> {
    /// Whatever the transition function returned
    pub output: R,
    /// True when the transition emptied the session and it was dropped
    pub removed: bool,
}

/// Keyed store of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Non-mutating lookup. Returns a snapshot, never a reference into the table.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Insert a new active session with `initial_host` as its only member, unless one
    /// already exists under `id`. The second value tells whether this call created it.
    pub fn create_or_get(&self, id: &str, initial_host: ConnectionId) -> (Session, bool) {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = Session::new(id, initial_host);
                entry.insert(session.clone());
                debug!(session_id = %id, host = %initial_host, "Session inserted");
                (session, true)
            }
        }
    }

    /// Join `id` as `conn`, creating the session first if it does not exist and
    /// `allow_create` is set. Runs as one critical section, so a join can never land
    /// on a session that is being removed concurrently.
    pub fn join_or_create(&self, id: &str, conn: ConnectionId, allow_create: bool) -> JoinOutcome {
        match self.sessions.entry(id.to_string()) {
            Entry::Vacant(entry) => {
                if !allow_create {
                    return JoinOutcome::NotFound;
                }
                let session = Session::new(id, conn);
                entry.insert(session.clone());
                debug!(session_id = %id, host = %conn, "Session inserted on join");
                JoinOutcome::Created(session)
            }
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                if !session.is_active() {
                    return JoinOutcome::Closing;
                }
                if session.add_member(conn) {
                    JoinOutcome::Joined(session.clone())
                } else {
                    JoinOutcome::AlreadyMember(session.clone())
                }
            }
        }
    }

    /// Apply `transition` to the session under its entry lock.
    ///
    /// Returns `None` without calling `transition` when the id is absent; callers
    /// treat that as a benign no-op because disconnect and leave races routinely land
    /// after a session is gone. If the transition leaves the session without
    /// members, the entry is removed before the lock is released.
    pub fn mutate<R>(&self, id: &str, transition: impl FnOnce(&mut Session) -> R) -> Option<Applied<R>> {
        match self.sessions.entry(id.to_string()) {
            Entry::Vacant(_) => None,
            Entry::Occupied(mut entry) => {
                let output = transition(entry.get_mut());
                let removed = entry.get().member_count() == 0;
                if removed {
                    entry.remove();
                    debug!(session_id = %id, "Session emptied and removed");
                }
                Some(Applied { output, removed })
            }
        }
    }

    /// Delete the entry only if it is still the closing incarnation identified by
    /// `generation`. Used when a close grace period expires; if the session emptied
    /// out in the meantime, or the id was reused, this is a no-op.
    pub fn remove_if_closing(&self, id: &str, generation: u64) -> bool {
        self.sessions
            .remove_if(id, |_, session| {
                session.state() == SessionState::Closing && session.generation() == generation
            })
            .is_some()
    }

    /// Point-in-time listing for diagnostics, oldest session first.
    ///
    /// Shards are read one after another, so this is not a transactional snapshot.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Ids of every session that lists `conn` as a member.
    pub fn sessions_of(&self, conn: ConnectionId) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_member(conn))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_create_or_get_is_idempotent() {
        let registry = SessionRegistry::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();

        let (session, created) = registry.create_or_get("room1", first);
        assert!(created);
        assert_eq!(session.host(), first);

        let (session, created) = registry.create_or_get("room1", second);
        assert!(!created);
        assert_eq!(session.host(), first);
        assert_eq!(session.members(), &[first]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_join_or_create_outcomes() {
        let registry = SessionRegistry::new();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();

        assert!(matches!(registry.join_or_create("room1", host, false), JoinOutcome::NotFound));
        assert!(registry.get("room1").is_none());

        assert!(matches!(registry.join_or_create("room1", host, true), JoinOutcome::Created(_)));
        assert!(matches!(registry.join_or_create("room1", guest, true), JoinOutcome::Joined(_)));
        assert!(matches!(registry.join_or_create("room1", guest, true), JoinOutcome::AlreadyMember(_)));

        registry.mutate("room1", |s| s.begin_closing());
        assert!(matches!(
            registry.join_or_create("room1", ConnectionId::new(), true),
            JoinOutcome::Closing
        ));
    }

    #[test]
    fn test_mutate_absent_is_noop() {
        let registry = SessionRegistry::new();
        let mut called = false;
        let applied = registry.mutate("ghost", |_| called = true);
        assert!(applied.is_none());
        assert!(!called);
    }

    #[test]
    fn test_emptied_session_is_removed_immediately() {
        let registry = SessionRegistry::new();
        let host = ConnectionId::new();
        registry.create_or_get("room1", host);

        let applied = registry.mutate("room1", |s| s.remove_member(host)).unwrap();

        assert!(applied.removed);
        assert!(registry.get("room1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_closing_checks_generation() {
        let registry = SessionRegistry::new();
        let host = ConnectionId::new();
        let (session, _) = registry.create_or_get("room1", host);

        // still active: the timer must not remove it
        assert!(!registry.remove_if_closing("room1", session.generation()));

        registry.mutate("room1", |s| s.begin_closing());
        assert!(!registry.remove_if_closing("room1", session.generation() + 1_000_000));
        assert!(registry.remove_if_closing("room1", session.generation()));
        assert!(registry.get("room1").is_none());
    }

    #[test]
    fn test_reused_id_survives_stale_timer() {
        let registry = SessionRegistry::new();
        let host = ConnectionId::new();
        let (old, _) = registry.create_or_get("room1", host);
        registry.mutate("room1", |s| s.begin_closing());
        registry.mutate("room1", |s| s.remove_member(host));
        assert!(registry.get("room1").is_none());

        let (fresh, created) = registry.create_or_get("room1", host);
        assert!(created);
        registry.mutate("room1", |s| s.begin_closing());

        assert!(!registry.remove_if_closing("room1", old.generation()));
        assert!(registry.get("room1").is_some());
        assert!(registry.remove_if_closing("room1", fresh.generation()));
    }

    #[test]
    fn test_sessions_of_and_list() {
        let registry = SessionRegistry::new();
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        registry.create_or_get("a", alice);
        registry.create_or_get("b", bob);
        registry.join_or_create("b", alice, true);

        let mut ids = registry.sessions_of(alice);
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.sessions_of(bob), vec!["b".to_string()]);

        let listing = registry.list();
        assert_eq!(listing.len(), 2);
        let b = listing.iter().find(|s| s.id == "b").unwrap();
        assert_eq!(b.member_count, 2);
        assert_eq!(b.host, bob);
        assert!(b.active);
    }

    #[test]
    fn test_concurrent_creates_produce_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let conn = ConnectionId::new();
                    let (session, created) = registry.create_or_get("race", conn);
                    (conn, session.host(), created)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let creators: Vec<_> = results.iter().filter(|(_, _, created)| *created).collect();
        assert_eq!(creators.len(), 1);

        let winner = creators[0].0;
        assert!(results.iter().all(|(_, host, _)| *host == winner));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_join_leave_leaves_no_phantoms() {
        let registry = Arc::new(SessionRegistry::new());
        let host = ConnectionId::new();
        registry.create_or_get("busy", host);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let conn = ConnectionId::new();
                    registry.join_or_create("busy", conn, true);
                    if i % 2 == 0 {
                        registry.mutate("busy", |s| s.remove_member(conn));
                        None
                    } else {
                        Some(conn)
                    }
                })
            })
            .collect();

        let stayed: HashSet<ConnectionId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .chain(std::iter::once(host))
            .collect();

        let session = registry.get("busy").unwrap();
        let members: HashSet<ConnectionId> = session.members().iter().copied().collect();
        assert_eq!(members.len(), session.member_count());
        assert_eq!(members, stayed);
        assert!(session.is_member(session.host()));
    }
}

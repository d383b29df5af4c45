//! # Relay Coordinator
//!
//! Turns connection events into registry transitions and outbound messages.
//!
//! ## Flow for every command:
//! 1. Apply the transition inside the registry's per-session critical section
//! 2. Snapshot the recipients while the entry is held
//! 3. Release the entry, then deliver through the [`Outbox`]
//!
//! Delivery never happens while a session entry is locked, so a slow or dead
//! connection cannot stall other events for the same session.
//!
//! ## Error Policy:
//! Errors go to the originating connection only. Events for sessions that are
//! already gone or closing are silent no-ops: retries and a `leave` racing the
//! transport's own disconnect are expected, not exceptional.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::outbox::Outbox;
use crate::relay::protocol::{ConnectStatus, Outbound, Role, ServerEvent};
use crate::relay::registry::{JoinOutcome, SessionRegistry};
use crate::relay::session::{ConnectionId, SessionId};
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One inbound event, already attributed to a connection by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateSession { session_id: SessionId },
    JoinSession { session_id: SessionId },
    CheckSession { session_id: SessionId },
    LeaveSession { session_id: SessionId },
    CloseSession { session_id: SessionId },
    AudioChunk { session_id: SessionId, payload: Bytes },
    RecordingStarted { session_id: SessionId },
    StopRecording { session_id: SessionId },
    /// The connection ended; leave every session it belongs to
    Disconnect,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateSession { .. } => "create-session",
            Command::JoinSession { .. } => "join-session",
            Command::CheckSession { .. } => "check-session",
            Command::LeaveSession { .. } => "leave-session",
            Command::CloseSession { .. } => "close-session",
            Command::AudioChunk { .. } => "audio-chunk",
            Command::RecordingStarted { .. } => "recording-started",
            Command::StopRecording { .. } => "stop-recording",
            Command::Disconnect => "disconnect",
        }
    }
}

/// What a command did to the sending connection's own membership.
///
/// The socket uses this to decide which session its binary frames belong to, so
/// it only ever follows sessions the connection really is a member of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// The sender is a member of this active session
    Member(SessionId),
    /// The sender left this session, or it stopped relaying
    Departed(SessionId),
    Unchanged,
}

/// Tunables the coordinator needs from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Delay between `close-session` and final removal
    pub close_grace: Duration,
    /// Largest audio chunk that will be forwarded
    pub max_payload_bytes: usize,
    /// Reject joins on unknown ids instead of creating the session
    pub strict_join: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            close_grace: Duration::from_millis(config.close_grace_ms),
            max_payload_bytes: config.max_payload_bytes,
            strict_join: config.strict_join,
        }
    }
}

/// Running counters, reported by the metrics endpoint.
#[derive(Debug, Default)]
pub struct RelayStats {
    sessions_created: AtomicU64,
    sessions_removed: AtomicU64,
    chunks_forwarded: AtomicU64,
    chunks_dropped: AtomicU64,
    deliveries_failed: AtomicU64,
}

/// Copy of [`RelayStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub sessions_created: u64,
    pub sessions_removed: u64,
    pub chunks_forwarded: u64,
    pub chunks_dropped: u64,
    pub deliveries_failed: u64,
}

impl RelayStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_removed: self.sessions_removed.load(Ordering::Relaxed),
            chunks_forwarded: self.chunks_forwarded.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

enum CloseOutcome {
    AlreadyClosing,
    NotHost,
    Closing {
        members: Vec<ConnectionId>,
        generation: u64,
    },
}

/// Applies connection events to the [`SessionRegistry`] and fans out the results.
///
/// Holds no per-connection state of its own; every call carries the connection id
/// it acts for. Shared between all WebSocket actors behind an `Arc`.
pub struct RelayCoordinator {
    registry: Arc<SessionRegistry>,
    outbox: Arc<dyn Outbox>,
    settings: RelaySettings,
    stats: Arc<RelayStats>,
}

impl RelayCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, outbox: Arc<dyn Outbox>, settings: RelaySettings) -> Self {
        Self {
            registry,
            outbox,
            settings,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Dispatch one command on behalf of connection `from`.
    pub fn handle(&self, from: ConnectionId, command: Command) -> Membership {
        debug!(connection_id = %from, command = command.name(), "Handling relay command");

        match command {
            Command::CreateSession { session_id } => self.create_session(from, session_id),
            Command::JoinSession { session_id } => self.join_session(from, session_id),
            Command::LeaveSession { session_id } => self.leave_session(from, &session_id),
            Command::CloseSession { session_id } => self.close_session(from, session_id),
            Command::CheckSession { session_id } => {
                self.check_session(from, session_id);
                Membership::Unchanged
            }
            Command::AudioChunk { session_id, payload } => {
                self.audio_chunk(from, &session_id, payload);
                Membership::Unchanged
            }
            Command::RecordingStarted { session_id } => {
                self.recording_started(from, &session_id);
                Membership::Unchanged
            }
            Command::StopRecording { session_id } => {
                self.stop_recording(from, &session_id);
                Membership::Unchanged
            }
            Command::Disconnect => {
                self.disconnect(from);
                Membership::Unchanged
            }
        }
    }

    fn create_session(&self, from: ConnectionId, session_id: SessionId) -> Membership {
        let (session, created) = self.registry.create_or_get(&session_id, from);

        if created {
            RelayStats::bump(&self.stats.sessions_created);
            info!(session_id = %session_id, host = %from, "Session created");
            self.send(
                from,
                ServerEvent::Connected {
                    session_id: session_id.clone(),
                    role: Role::Host,
                    host: Some(from),
                    status: None,
                },
            );
            return Membership::Member(session_id);
        }

        if !session.is_active() {
            self.reject(from, RelayError::SessionClosed(session_id));
            return Membership::Unchanged;
        }

        debug!(session_id = %session_id, connection_id = %from, "Create on existing session ignored");

        // `connected` always means membership; outsiders only learn the id is taken
        if !session.is_member(from) {
            self.send(from, ServerEvent::SessionStatus { session_id, exists: true });
            return Membership::Unchanged;
        }

        let role = if session.is_host(from) { Role::Host } else { Role::Participant };
        self.send(
            from,
            ServerEvent::Connected {
                session_id: session_id.clone(),
                role,
                host: Some(session.host()),
                status: Some(ConnectStatus::Exists),
            },
        );
        Membership::Member(session_id)
    }

    fn join_session(&self, from: ConnectionId, session_id: SessionId) -> Membership {
        let allow_create = !self.settings.strict_join;

        match self.registry.join_or_create(&session_id, from, allow_create) {
            JoinOutcome::Created(_) => {
                RelayStats::bump(&self.stats.sessions_created);
                info!(session_id = %session_id, host = %from, "Session created on join");
                self.send(
                    from,
                    ServerEvent::Connected {
                        session_id: session_id.clone(),
                        role: Role::Host,
                        host: Some(from),
                        status: Some(ConnectStatus::CreatedOnJoin),
                    },
                );
                Membership::Member(session_id)
            }
            JoinOutcome::Joined(session) => {
                info!(
                    session_id = %session_id,
                    participant = %from,
                    members = session.member_count(),
                    "Participant joined"
                );
                let peers = session.peers_of(from);
                self.send(
                    from,
                    ServerEvent::Connected {
                        session_id: session_id.clone(),
                        role: Role::Participant,
                        host: Some(session.host()),
                        status: None,
                    },
                );
                self.send(
                    from,
                    ServerEvent::ParticipantsList {
                        session_id: session_id.clone(),
                        participants: peers.clone(),
                    },
                );
                self.broadcast(&peers, ServerEvent::ParticipantJoined { participant_id: from });
                Membership::Member(session_id)
            }
            JoinOutcome::AlreadyMember(session) => {
                let role = if session.is_host(from) { Role::Host } else { Role::Participant };
                self.send(
                    from,
                    ServerEvent::Connected {
                        session_id: session_id.clone(),
                        role,
                        host: Some(session.host()),
                        status: None,
                    },
                );
                self.send(
                    from,
                    ServerEvent::ParticipantsList {
                        session_id: session_id.clone(),
                        participants: session.peers_of(from),
                    },
                );
                Membership::Member(session_id)
            }
            JoinOutcome::Closing => {
                self.reject(from, RelayError::SessionClosed(session_id));
                Membership::Unchanged
            }
            JoinOutcome::NotFound => {
                self.reject(from, RelayError::SessionNotFound(session_id));
                Membership::Unchanged
            }
        }
    }

    fn check_session(&self, from: ConnectionId, session_id: SessionId) {
        let exists = self
            .registry
            .get(&session_id)
            .map_or(false, |session| session.is_active());

        self.send(from, ServerEvent::SessionStatus { session_id, exists });
    }

    fn leave_session(&self, from: ConnectionId, session_id: &str) -> Membership {
        let applied = self.registry.mutate(session_id, |session| {
            let was_active = session.is_active();
            session
                .remove_member(from)
                .map(|departure| (was_active, departure, session.members().to_vec()))
        });

        let Some(applied) = applied else {
            debug!(session_id = %session_id, connection_id = %from, "Leave for unknown session ignored");
            return Membership::Unchanged;
        };

        if applied.removed {
            RelayStats::bump(&self.stats.sessions_removed);
            info!(session_id = %session_id, "Last member left, session removed");
        }

        let Some((was_active, departure, remaining)) = applied.output else {
            debug!(session_id = %session_id, connection_id = %from, "Leave from non-member ignored");
            return Membership::Unchanged;
        };

        // closing sessions were already told they are over
        if !was_active {
            return Membership::Departed(session_id.to_string());
        }

        info!(session_id = %session_id, participant = %from, "Participant left");
        self.broadcast(&remaining, ServerEvent::ParticipantLeft { participant_id: from });

        if let Some(host_id) = departure.new_host {
            info!(session_id = %session_id, host = %host_id, "Host reassigned");
            self.broadcast(
                &remaining,
                ServerEvent::NewHost {
                    session_id: session_id.to_string(),
                    host_id,
                },
            );
        }
        Membership::Departed(session_id.to_string())
    }

    fn close_session(&self, from: ConnectionId, session_id: SessionId) -> Membership {
        let applied = self.registry.mutate(&session_id, |session| {
            if !session.is_active() {
                return CloseOutcome::AlreadyClosing;
            }
            if !session.is_host(from) {
                return CloseOutcome::NotHost;
            }
            session.begin_closing();
            CloseOutcome::Closing {
                members: session.members().to_vec(),
                generation: session.generation(),
            }
        });

        let Some(applied) = applied else {
            debug!(session_id = %session_id, "Close for unknown session ignored");
            return Membership::Unchanged;
        };

        match applied.output {
            CloseOutcome::AlreadyClosing => {
                debug!(session_id = %session_id, "Session already closing");
                Membership::Unchanged
            }
            CloseOutcome::NotHost => {
                self.reject(from, RelayError::NotHost(session_id));
                Membership::Unchanged
            }
            CloseOutcome::Closing { members, generation } => {
                info!(
                    session_id = %session_id,
                    grace_ms = self.settings.close_grace.as_millis() as u64,
                    "Session closing"
                );
                self.broadcast(&members, ServerEvent::SessionClosed { session_id: session_id.clone() });
                self.schedule_removal(session_id.clone(), generation);
                Membership::Departed(session_id)
            }
        }
    }

    /// Remove a closed session once the grace period has passed.
    ///
    /// Nothing cancels this timer. At fire time it only removes the entry if it is
    /// still the same closing incarnation, so an emptied or reused id is left alone.
    fn schedule_removal(&self, session_id: SessionId, generation: u64) {
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let grace = self.settings.close_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            if registry.remove_if_closing(&session_id, generation) {
                RelayStats::bump(&stats.sessions_removed);
                info!(session_id = %session_id, "Closed session removed after grace period");
            } else {
                debug!(session_id = %session_id, "Closed session already gone at timer expiry");
            }
        });
    }

    fn audio_chunk(&self, from: ConnectionId, session_id: &str, payload: Bytes) {
        if payload.len() > self.settings.max_payload_bytes {
            RelayStats::bump(&self.stats.chunks_dropped);
            self.reject(
                from,
                RelayError::PayloadTooLarge {
                    size: payload.len(),
                    limit: self.settings.max_payload_bytes,
                },
            );
            return;
        }

        let recipients = match self.registry.get(session_id) {
            Some(session) if session.is_active() && session.is_member(from) => session.peers_of(from),
            _ => {
                RelayStats::bump(&self.stats.chunks_dropped);
                debug!(session_id = %session_id, connection_id = %from, "Audio chunk dropped");
                return;
            }
        };

        for to in recipients {
            self.deliver(to, Outbound::Audio(payload.clone()));
        }
        RelayStats::bump(&self.stats.chunks_forwarded);
    }

    fn recording_started(&self, from: ConnectionId, session_id: &str) {
        let Some(members) = self.active_members_for(from, session_id) else {
            return;
        };
        let peers: Vec<_> = members.into_iter().filter(|m| *m != from).collect();
        info!(session_id = %session_id, participant = %from, "Recording started");
        self.broadcast(&peers, ServerEvent::ParticipantRecording { participant_id: from });
    }

    fn stop_recording(&self, from: ConnectionId, session_id: &str) {
        let Some(members) = self.active_members_for(from, session_id) else {
            return;
        };
        info!(session_id = %session_id, participant = %from, "Recording stopped");
        self.broadcast(
            &members,
            ServerEvent::StopRecording {
                session_id: session_id.to_string(),
            },
        );
    }

    fn disconnect(&self, from: ConnectionId) {
        let sessions = self.registry.sessions_of(from);
        if !sessions.is_empty() {
            info!(connection_id = %from, sessions = sessions.len(), "Cleaning up after disconnect");
        }
        for session_id in sessions {
            let _ = self.leave_session(from, &session_id);
        }
    }

    /// Members of an active session that `from` belongs to; `None` otherwise.
    fn active_members_for(&self, from: ConnectionId, session_id: &str) -> Option<Vec<ConnectionId>> {
        match self.registry.get(session_id) {
            Some(session) if session.is_active() && session.is_member(from) => Some(session.members().to_vec()),
            _ => {
                debug!(session_id = %session_id, connection_id = %from, "Signal for inactive session ignored");
                None
            }
        }
    }

    fn reject(&self, to: ConnectionId, error: RelayError) {
        warn!(connection_id = %to, error = %error, "Rejecting relay command");
        if let Some(event) = error.to_event() {
            self.send(to, event);
        }
    }

    fn send(&self, to: ConnectionId, event: ServerEvent) {
        self.deliver(to, Outbound::Event(event));
    }

    fn broadcast(&self, recipients: &[ConnectionId], event: ServerEvent) {
        for to in recipients {
            self.send(*to, event.clone());
        }
    }

    fn deliver(&self, to: ConnectionId, message: Outbound) {
        if let Err(err) = self.outbox.deliver(to, message) {
            RelayStats::bump(&self.stats.deliveries_failed);
            debug!(connection_id = %to, error = %err, "Delivery dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::outbox::recording::RecordingOutbox;
    use crate::relay::protocol::ErrorCode;

    fn coordinator_with(settings: RelaySettings) -> (RelayCoordinator, Arc<RecordingOutbox>) {
        let outbox = Arc::new(RecordingOutbox::new());
        let coordinator = RelayCoordinator::new(Arc::new(SessionRegistry::new()), outbox.clone(), settings);
        (coordinator, outbox)
    }

    fn coordinator() -> (RelayCoordinator, Arc<RecordingOutbox>) {
        coordinator_with(RelaySettings {
            close_grace: Duration::from_secs(5),
            max_payload_bytes: 1024,
            strict_join: false,
        })
    }

    fn create(id: &str) -> Command {
        Command::CreateSession { session_id: id.to_string() }
    }

    fn join(id: &str) -> Command {
        Command::JoinSession { session_id: id.to_string() }
    }

    fn leave(id: &str) -> Command {
        Command::LeaveSession { session_id: id.to_string() }
    }

    fn close(id: &str) -> Command {
        Command::CloseSession { session_id: id.to_string() }
    }

    fn check(id: &str) -> Command {
        Command::CheckSession { session_id: id.to_string() }
    }

    fn chunk(id: &str, payload: &Bytes) -> Command {
        Command::AudioChunk {
            session_id: id.to_string(),
            payload: payload.clone(),
        }
    }

    fn error_codes(events: &[ServerEvent]) -> Vec<ErrorCode> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::SessionError { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_create_replies_connected_as_host() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();

        relay.handle(host, create("room1"));

        assert_eq!(
            outbox.events_for(host),
            vec![ServerEvent::Connected {
                session_id: "room1".to_string(),
                role: Role::Host,
                host: Some(host),
                status: None,
            }]
        );
        assert_eq!(relay.stats().sessions_created, 1);
    }

    #[test]
    fn test_duplicate_create_keeps_first_host() {
        let (relay, outbox) = coordinator();
        let first = ConnectionId::new();
        let second = ConnectionId::new();

        relay.handle(first, create("room1"));
        relay.handle(second, create("room1"));

        let session = relay.registry().get("room1").unwrap();
        assert_eq!(session.host(), first);
        assert_eq!(session.members(), &[first]);
        assert_eq!(relay.registry().len(), 1);
        assert_eq!(
            outbox.events_for(second),
            vec![ServerEvent::SessionStatus {
                session_id: "room1".to_string(),
                exists: true,
            }]
        );
    }

    #[test]
    fn test_create_by_member_confirms_existing_session() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));
        outbox.clear();

        assert_eq!(relay.handle(guest, create("room1")), Membership::Member("room1".to_string()));
        assert_eq!(
            outbox.events_for(guest),
            vec![ServerEvent::Connected {
                session_id: "room1".to_string(),
                role: Role::Participant,
                host: Some(host),
                status: Some(ConnectStatus::Exists),
            }]
        );
        assert!(outbox.events_for(host).is_empty());
    }

    #[test]
    fn test_membership_reported_to_sender() {
        let (relay, _outbox) = coordinator_with(RelaySettings {
            strict_join: true,
            ..RelaySettings::default()
        });
        let host = ConnectionId::new();
        let other = ConnectionId::new();

        assert_eq!(relay.handle(host, create("a")), Membership::Member("a".to_string()));
        assert_eq!(relay.handle(other, create("b")), Membership::Member("b".to_string()));

        // someone else's session, an unknown id in strict mode, a non-member leave
        assert_eq!(relay.handle(host, create("b")), Membership::Unchanged);
        assert_eq!(relay.handle(host, join("missing")), Membership::Unchanged);
        assert_eq!(relay.handle(host, leave("b")), Membership::Unchanged);
        assert_eq!(relay.handle(host, check("a")), Membership::Unchanged);

        assert_eq!(relay.handle(other, close("a")), Membership::Unchanged);
        assert_eq!(relay.handle(host, join("b")), Membership::Member("b".to_string()));
        assert_eq!(relay.handle(host, leave("b")), Membership::Departed("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_join_of_closing_session_keeps_membership_unchanged() {
        let (relay, _outbox) = coordinator();
        let host = ConnectionId::new();
        let late = ConnectionId::new();
        relay.handle(host, create("room1"));

        assert_eq!(relay.handle(host, close("room1")), Membership::Departed("room1".to_string()));
        assert_eq!(relay.handle(late, join("room1")), Membership::Unchanged);
        assert_eq!(relay.handle(late, create("room1")), Membership::Unchanged);
    }

    #[test]
    fn test_join_notifies_sender_and_peers() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        outbox.clear();

        relay.handle(guest, join("room1"));

        assert_eq!(
            outbox.events_for(guest),
            vec![
                ServerEvent::Connected {
                    session_id: "room1".to_string(),
                    role: Role::Participant,
                    host: Some(host),
                    status: None,
                },
                ServerEvent::ParticipantsList {
                    session_id: "room1".to_string(),
                    participants: vec![host],
                },
            ]
        );
        assert_eq!(
            outbox.events_for(host),
            vec![ServerEvent::ParticipantJoined { participant_id: guest }]
        );
    }

    #[test]
    fn test_join_unknown_creates_session() {
        let (relay, outbox) = coordinator();
        let conn = ConnectionId::new();

        relay.handle(conn, join("typo"));

        assert_eq!(
            outbox.events_for(conn),
            vec![ServerEvent::Connected {
                session_id: "typo".to_string(),
                role: Role::Host,
                host: Some(conn),
                status: Some(ConnectStatus::CreatedOnJoin),
            }]
        );
        assert_eq!(relay.registry().get("typo").unwrap().host(), conn);
    }

    #[test]
    fn test_strict_join_rejects_unknown_session() {
        let (relay, outbox) = coordinator_with(RelaySettings {
            strict_join: true,
            ..RelaySettings::default()
        });
        let conn = ConnectionId::new();

        relay.handle(conn, join("typo"));

        assert_eq!(error_codes(&outbox.events_for(conn)), vec![ErrorCode::SessionNotFound]);
        assert!(relay.registry().get("typo").is_none());
    }

    #[test]
    fn test_rejoin_does_not_duplicate_member() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));
        outbox.clear();

        relay.handle(guest, join("room1"));

        assert_eq!(relay.registry().get("room1").unwrap().member_count(), 2);
        assert!(outbox.events_for(host).is_empty());
    }

    #[test]
    fn test_close_by_non_host_is_rejected() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));
        outbox.clear();

        relay.handle(guest, close("room1"));

        assert_eq!(error_codes(&outbox.events_for(guest)), vec![ErrorCode::NotSessionHost]);
        assert!(outbox.events_for(host).is_empty());
        assert!(relay.registry().get("room1").unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_notifies_everyone_and_removes_after_grace() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));
        outbox.clear();

        relay.handle(host, close("room1"));

        let closed = ServerEvent::SessionClosed { session_id: "room1".to_string() };
        assert_eq!(outbox.events_for(host), vec![closed.clone()]);
        assert_eq!(outbox.events_for(guest), vec![closed]);

        // closing: still present, but not joinable or reported as existing
        assert!(relay.registry().get("room1").is_some());
        let latecomer = ConnectionId::new();
        relay.handle(latecomer, join("room1"));
        assert_eq!(error_codes(&outbox.events_for(latecomer)), vec![ErrorCode::SessionClosed]);
        relay.handle(latecomer, check("room1"));
        assert!(outbox.events_for(latecomer).contains(&ServerEvent::SessionStatus {
            session_id: "room1".to_string(),
            exists: false,
        }));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(relay.registry().get("room1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_close_and_leave_after_close_are_noops() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));
        relay.handle(host, close("room1"));
        outbox.clear();

        relay.handle(host, close("room1"));
        relay.handle(guest, leave("room1"));
        relay.handle(guest, Command::StopRecording { session_id: "room1".to_string() });

        assert!(outbox.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_then_empty_leaves_no_stale_entry() {
        let (relay, _outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));

        relay.handle(host, close("room1"));
        relay.handle(guest, leave("room1"));
        relay.handle(host, Command::Disconnect);

        // emptied immediately, the timer has nothing left to do
        assert!(relay.registry().get("room1").is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(relay.registry().is_empty());
        assert_eq!(relay.stats().sessions_removed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_spares_recreated_session() {
        let (relay, _outbox) = coordinator();
        let host = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(host, close("room1"));
        relay.handle(host, leave("room1"));

        relay.handle(host, create("room1"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        let session = relay.registry().get("room1").unwrap();
        assert!(session.is_active());
        assert_eq!(session.host(), host);
    }

    #[test]
    fn test_audio_fanout_excludes_sender_and_other_sessions() {
        let (relay, outbox) = coordinator();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let c = ConnectionId::new();
        let outsider = ConnectionId::new();
        relay.handle(a, create("room1"));
        relay.handle(b, join("room1"));
        relay.handle(c, join("room1"));
        relay.handle(outsider, create("room2"));

        let payload = Bytes::from_static(b"\x00\x01pcm");
        relay.handle(a, chunk("room1", &payload));

        let mut recipients = outbox.audio_recipients(&payload);
        recipients.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(recipients, expected);
        assert_eq!(relay.stats().chunks_forwarded, 1);
    }

    #[test]
    fn test_audio_from_non_member_is_dropped() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let stranger = ConnectionId::new();
        relay.handle(host, create("room1"));

        let payload = Bytes::from_static(b"noise");
        relay.handle(stranger, chunk("room1", &payload));
        relay.handle(stranger, chunk("nowhere", &payload));

        assert!(outbox.audio_recipients(&payload).is_empty());
        assert!(outbox.events_for(stranger).is_empty());
        assert_eq!(relay.stats().chunks_dropped, 2);
    }

    #[test]
    fn test_oversized_chunk_is_reported_to_sender_only() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));
        outbox.clear();

        let payload = Bytes::from(vec![0u8; 2048]);
        relay.handle(host, chunk("room1", &payload));

        assert!(outbox.audio_recipients(&payload).is_empty());
        assert_eq!(error_codes(&outbox.events_for(host)), vec![ErrorCode::PayloadTooLarge]);
        assert!(outbox.events_for(guest).is_empty());
    }

    #[test]
    fn test_dead_recipient_does_not_block_fanout() {
        let (relay, outbox) = coordinator();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let c = ConnectionId::new();
        relay.handle(a, create("room1"));
        relay.handle(b, join("room1"));
        relay.handle(c, join("room1"));
        outbox.disconnect(b);

        let payload = Bytes::from_static(b"chunk");
        relay.handle(a, chunk("room1", &payload));

        assert_eq!(outbox.audio_recipients(&payload), vec![c]);
        assert_eq!(relay.stats().deliveries_failed, 1);
        assert_eq!(relay.registry().get("room1").unwrap().member_count(), 3);
    }

    #[test]
    fn test_recording_signals() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let guest = ConnectionId::new();
        relay.handle(host, create("room1"));
        relay.handle(guest, join("room1"));
        outbox.clear();

        relay.handle(host, Command::RecordingStarted { session_id: "room1".to_string() });
        assert!(outbox.events_for(host).is_empty());
        assert_eq!(
            outbox.events_for(guest),
            vec![ServerEvent::ParticipantRecording { participant_id: host }]
        );
        outbox.clear();

        relay.handle(host, Command::StopRecording { session_id: "room1".to_string() });
        let stop = ServerEvent::StopRecording { session_id: "room1".to_string() };
        assert_eq!(outbox.events_for(host), vec![stop.clone()]);
        assert_eq!(outbox.events_for(guest), vec![stop]);
    }

    #[test]
    fn test_disconnect_leaves_every_session() {
        let (relay, outbox) = coordinator();
        let roaming = ConnectionId::new();
        let other = ConnectionId::new();
        relay.handle(roaming, create("a"));
        relay.handle(other, join("a"));
        relay.handle(other, create("b"));
        relay.handle(roaming, join("b"));
        outbox.clear();

        relay.handle(roaming, Command::Disconnect);

        assert!(relay.registry().sessions_of(roaming).is_empty());
        let events = outbox.events_for(other);
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == ServerEvent::ParticipantLeft { participant_id: roaming })
                .count(),
            2
        );
        assert!(events.contains(&ServerEvent::NewHost {
            session_id: "a".to_string(),
            host_id: other,
        }));
    }

    #[test]
    fn test_leave_by_non_member_is_silent() {
        let (relay, outbox) = coordinator();
        let host = ConnectionId::new();
        let stranger = ConnectionId::new();
        relay.handle(host, create("room1"));
        outbox.clear();

        relay.handle(stranger, leave("room1"));
        relay.handle(stranger, leave("nowhere"));

        assert!(outbox.take().is_empty());
        assert_eq!(relay.registry().get("room1").unwrap().member_count(), 1);
    }

    #[test]
    fn test_room1_scenario() {
        let (relay, outbox) = coordinator();
        let h = ConnectionId::new();
        let p1 = ConnectionId::new();
        let p2 = ConnectionId::new();

        relay.handle(h, create("room1"));
        relay.handle(p1, join("room1"));
        relay.handle(p2, join("room1"));

        let x = Bytes::from_static(b"X");
        relay.handle(h, chunk("room1", &x));
        let mut recipients = outbox.audio_recipients(&x);
        recipients.sort();
        let mut expected = vec![p1, p2];
        expected.sort();
        assert_eq!(recipients, expected);
        outbox.clear();

        relay.handle(p1, leave("room1"));
        let left = ServerEvent::ParticipantLeft { participant_id: p1 };
        assert_eq!(outbox.events_for(h), vec![left.clone()]);
        assert_eq!(outbox.events_for(p2), vec![left]);
        assert!(outbox.events_for(p1).is_empty());
        outbox.clear();

        relay.handle(h, Command::Disconnect);
        assert!(outbox.events_for(p2).contains(&ServerEvent::NewHost {
            session_id: "room1".to_string(),
            host_id: p2,
        }));
        let session = relay.registry().get("room1").unwrap();
        assert!(session.is_active());
        assert_eq!(session.members(), &[p2]);
        assert_eq!(session.host(), p2);

        relay.handle(p2, leave("room1"));
        assert!(relay.registry().get("room1").is_none());

        outbox.clear();
        relay.handle(p1, check("room1"));
        assert_eq!(
            outbox.events_for(p1),
            vec![ServerEvent::SessionStatus {
                session_id: "room1".to_string(),
                exists: false,
            }]
        );
    }

    #[test]
    fn test_join_leave_replay_matches_membership() {
        let (relay, _outbox) = coordinator();
        let conns: Vec<_> = (0..6).map(|_| ConnectionId::new()).collect();
        relay.handle(conns[0], create("room1"));
        for conn in &conns[1..] {
            relay.handle(*conn, join("room1"));
        }
        // join twice, leave twice, disconnect: none of it may leave phantoms
        relay.handle(conns[2], join("room1"));
        relay.handle(conns[3], leave("room1"));
        relay.handle(conns[3], leave("room1"));
        relay.handle(conns[0], Command::Disconnect);

        let session = relay.registry().get("room1").unwrap();
        assert_eq!(session.members(), &[conns[1], conns[2], conns[4], conns[5]]);
        assert_eq!(session.host(), conns[1]);
    }
}

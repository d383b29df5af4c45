//! # Relay Wire Protocol
//!
//! JSON messages exchanged over `/ws/relay`. Text frames carry these messages,
//! binary frames carry raw audio chunks and never pass through this module.
//!
//! ## Message Format:
//! - Tagged by a `type` field in kebab-case (`"join-session"`, `"new-host"`, ...)
//! - Field names are camelCase (`sessionId`, `participantId`, ...)
//! - Error codes are SCREAMING_SNAKE_CASE (`SESSION_CLOSED`, ...)

use crate::relay::coordinator::Command;
use crate::relay::session::{ConnectionId, SessionId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages a client may send as a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateSession { session_id: SessionId },
    JoinSession { session_id: SessionId },
    CheckSession { session_id: SessionId },
    LeaveSession { session_id: SessionId },
    CloseSession { session_id: SessionId },
    RecordingStarted { session_id: SessionId },
    StopRecording { session_id: SessionId },
    /// Application-level heartbeat, answered with `pong`
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

impl ClientMessage {
    /// Convert into a coordinator command. Heartbeats stay with the socket and
    /// return `None`.
    pub fn into_command(self) -> Option<Command> {
        let command = match self {
            ClientMessage::CreateSession { session_id } => Command::CreateSession { session_id },
            ClientMessage::JoinSession { session_id } => Command::JoinSession { session_id },
            ClientMessage::CheckSession { session_id } => Command::CheckSession { session_id },
            ClientMessage::LeaveSession { session_id } => Command::LeaveSession { session_id },
            ClientMessage::CloseSession { session_id } => Command::CloseSession { session_id },
            ClientMessage::RecordingStarted { session_id } => Command::RecordingStarted { session_id },
            ClientMessage::StopRecording { session_id } => Command::StopRecording { session_id },
            ClientMessage::Ping { .. } | ClientMessage::Pong { .. } => return None,
        };
        Some(command)
    }
}

/// Role a connection holds within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Participant,
}

/// Extra context attached to a `connected` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectStatus {
    /// A `join-session` hit an unknown id and created the session instead
    CreatedOnJoin,
    /// A `create-session` hit an id that already exists
    Exists,
}

/// Machine-readable error codes delivered in `session-error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionClosed,
    NotSessionHost,
    SessionNotFound,
    PayloadTooLarge,
    InvalidMessage,
    NoActiveSession,
}

/// Events the server sends as a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// First message on every connection
    Ready { connection_id: ConnectionId },
    Connected {
        session_id: SessionId,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ConnectStatus>,
    },
    SessionError {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    ParticipantJoined { participant_id: ConnectionId },
    ParticipantLeft { participant_id: ConnectionId },
    ParticipantsList {
        session_id: SessionId,
        participants: Vec<ConnectionId>,
    },
    NewHost {
        session_id: SessionId,
        host_id: ConnectionId,
    },
    SessionClosed { session_id: SessionId },
    ParticipantRecording { participant_id: ConnectionId },
    StopRecording { session_id: SessionId },
    /// Reply to `check-session`
    SessionStatus { session_id: SessionId, exists: bool },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

/// Anything the coordinator can hand to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Forwarded audio chunk, sent as a binary frame byte-for-byte
    Audio(Bytes),
}

impl From<ServerEvent> for Outbound {
    fn from(event: ServerEvent) -> Self {
        Outbound::Event(event)
    }
}

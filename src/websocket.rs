//! # WebSocket Relay Handler
//!
//! Clients connect to `/ws/relay`, then create or join sessions and stream audio.
//! Each connection is one actix actor with its own [`ConnectionId`].
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Server sends `ready` with the connection id
//! 2. **Session control**: JSON text frames (`create-session`, `join-session`, ...)
//! 3. **Audio Streaming**: Binary frames, forwarded to the other members of the
//!    connection's current session
//! 4. **Disconnect**: Socket close, protocol error, or heartbeat timeout; the
//!    coordinator then removes the connection from every session it was in
//!
//! The actor keeps no session state beyond "which session do my binary frames
//! belong to". Everything else goes through the [`RelayCoordinator`].

use crate::error::RelayError;
use crate::relay::hub::Deliver;
use crate::relay::protocol::{ClientMessage, Outbound, ServerEvent};
use crate::relay::{Command, ConnectionHub, ConnectionId, Membership, RelayCoordinator, SessionId};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// WebSocket actor for one relay connection.
pub struct RelaySocket {
    /// Identity of this link, announced to the client in `ready`
    id: ConnectionId,

    /// Session that binary frames are attributed to
    current_session: Option<SessionId>,

    coordinator: Arc<RelayCoordinator>,

    hub: Arc<ConnectionHub>,

    /// Shared state, used for the live connection counter
    state: web::Data<AppState>,

    heartbeat_interval: Duration,
    client_timeout: Duration,
    mailbox_capacity: usize,

    /// Last time we heard anything from the client
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let config = state.get_config();

        Self {
            id: ConnectionId::new(),
            current_session: None,
            coordinator: state.coordinator.clone(),
            hub: state.hub.clone(),
            heartbeat_interval: Duration::from_secs(config.relay.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.relay.client_timeout_secs),
            mailbox_capacity: config.relay.mailbox_capacity,
            last_heartbeat: Instant::now(),
            state,
        }
    }

    /// Serialize and send one event to this client.
    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(connection_id = %self.id, "Failed to serialize event: {}", err),
        }
    }

    /// Report an error to this client only.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: RelayError) {
        warn!(connection_id = %self.id, "WebSocket error: {}", err);
        if let Some(event) = err.to_event() {
            self.send_event(ctx, &event);
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                self.send_error(ctx, RelayError::InvalidMessage(err.to_string()));
                return;
            }
        };

        match message {
            ClientMessage::Ping { timestamp } => self.send_event(ctx, &ServerEvent::Pong { timestamp }),
            ClientMessage::Pong { .. } => {}
            message => {
                if let Some(command) = message.into_command() {
                    let membership = self.coordinator.handle(self.id, command);
                    self.follow(membership);
                }
            }
        }
    }

    /// Move binary-frame attribution along with the connection's real membership.
    ///
    /// A rejected create or join leaves the current session untouched.
    fn follow(&mut self, membership: Membership) {
        match membership {
            Membership::Member(session_id) => {
                debug!(connection_id = %self.id, session_id = %session_id, "Audio now attributed to session");
                self.current_session = Some(session_id);
            }
            Membership::Departed(session_id) => {
                if self.current_session.as_ref() == Some(&session_id) {
                    self.current_session = None;
                }
            }
            Membership::Unchanged => {}
        }
    }

    fn handle_binary(&mut self, payload: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session_id) = self.current_session.clone() else {
            self.send_error(ctx, RelayError::NoActiveSession);
            return;
        };

        self.coordinator.handle(self.id, Command::AudioChunk { session_id, payload });
    }

    /// Ping the client periodically and drop it once it has been silent too long.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(connection_id = %act.id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(self.mailbox_capacity);
        self.hub.register(self.id, ctx.address().recipient());
        self.state.increment_active_connections();
        info!(connection_id = %self.id, "Relay connection started");

        self.send_event(ctx, &ServerEvent::Ready { connection_id: self.id });
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // unregister first so the cleanup fan-out does not try to reach us
        self.hub.unregister(self.id);
        self.coordinator.handle(self.id, Command::Disconnect);
        self.state.decrement_active_connections();
        info!(connection_id = %self.id, "Relay connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_binary(data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outbound messages queued by the coordinator through the hub.
impl Handler<Deliver> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        match msg.0 {
            Outbound::Event(event) => {
                if let ServerEvent::SessionClosed { session_id } = &event {
                    if self.current_session.as_ref() == Some(session_id) {
                        self.current_session = None;
                    }
                }
                self.send_event(ctx, &event);
            }
            Outbound::Audio(payload) => ctx.binary(payload),
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Refuses the upgrade with 503 once `relay.max_connections` is reached. The frame
/// size limit is twice the chunk ceiling: slightly oversized chunks still reach the
/// coordinator and get a structured `PAYLOAD_TOO_LARGE`, absurd ones fail at the
/// protocol layer and close the socket.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();
    debug!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    if state.hub.len() >= config.relay.max_connections {
        warn!(limit = config.relay.max_connections, "Connection limit reached, refusing upgrade");
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "error": {
                "type": "connection_limit",
                "message": format!("Maximum of {} connections reached", config.relay.max_connections),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    }

    let frame_size = config.relay.max_payload_bytes.saturating_mul(2);
    ws::WsResponseBuilder::new(RelaySocket::new(state), &req, stream)
        .frame_size(frame_size)
        .start()
}

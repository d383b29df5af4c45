//! # Connection Hub
//!
//! The production [`Outbox`]: a map from connection id to the mailbox of that
//! connection's WebSocket actor. Actors register themselves when they start and
//! unregister when they stop.

use crate::error::RelayError;
use crate::relay::outbox::Outbox;
use crate::relay::protocol::Outbound;
use crate::relay::session::ConnectionId;
use actix::prelude::*;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Actor message carrying one outbound relay message to a WebSocket actor.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver(pub Outbound);

/// Live connections, keyed by id.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<ConnectionId, Recipient<Deliver>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn register(&self, id: ConnectionId, recipient: Recipient<Deliver>) {
        self.connections.insert(id, recipient);
        debug!(connection_id = %id, "Connection registered");
    }

    pub fn unregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            debug!(connection_id = %id, "Connection unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Outbox for ConnectionHub {
    /// Queue `message` in the target actor's mailbox without waiting.
    ///
    /// The recipient is cloned out of the map first so no shard lock is held while
    /// talking to the actor.
    fn deliver(&self, to: ConnectionId, message: Outbound) -> Result<(), RelayError> {
        let recipient = self
            .connections
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::TransportGone(to))?;

        recipient.try_send(Deliver(message)).map_err(|err| match err {
            SendError::Full(_) => {
                warn!(connection_id = %to, "Connection mailbox full, dropping message");
                RelayError::MailboxFull(to)
            }
            SendError::Closed(_) => RelayError::TransportGone(to),
        })
    }
}

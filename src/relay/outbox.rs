//! Delivery seam between the coordinator and the transport.

use crate::error::RelayError;
use crate::relay::protocol::Outbound;
use crate::relay::session::ConnectionId;

/// Something that can push a message to a connection by id.
///
/// Implementations must not block: the coordinator calls `deliver` once per
/// recipient during fan-out. A connection that vanished reports
/// [`RelayError::TransportGone`]; the coordinator drops the message and leaves the
/// cleanup to that connection's own disconnect.
pub trait Outbox: Send + Sync {
    fn deliver(&self, to: ConnectionId, message: Outbound) -> Result<(), RelayError>;
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use crate::relay::protocol::ServerEvent;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Test outbox that records every delivery in order.
    #[derive(Default)]
    pub struct RecordingOutbox {
        sent: Mutex<Vec<(ConnectionId, Outbound)>>,
        gone: Mutex<HashSet<ConnectionId>>,
    }

    impl RecordingOutbox {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every later delivery to `conn` fail with `TransportGone`.
        pub fn disconnect(&self, conn: ConnectionId) {
            self.gone.lock().unwrap().insert(conn);
        }

        /// Drain everything recorded so far.
        pub fn take(&self) -> Vec<(ConnectionId, Outbound)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        /// JSON events addressed to `conn` recorded so far.
        pub fn events_for(&self, conn: ConnectionId) -> Vec<ServerEvent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| *to == conn)
                .filter_map(|(_, msg)| match msg {
                    Outbound::Event(event) => Some(event.clone()),
                    Outbound::Audio(_) => None,
                })
                .collect()
        }

        /// Recipients of audio payload `payload` recorded so far.
        pub fn audio_recipients(&self, payload: &Bytes) -> Vec<ConnectionId> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, msg)| matches!(msg, Outbound::Audio(bytes) if bytes == payload))
                .map(|(to, _)| *to)
                .collect()
        }

        pub fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    impl Outbox for RecordingOutbox {
        fn deliver(&self, to: ConnectionId, message: Outbound) -> Result<(), RelayError> {
            if self.gone.lock().unwrap().contains(&to) {
                return Err(RelayError::TransportGone(to));
            }
            self.sent.lock().unwrap().push((to, message));
            Ok(())
        }
    }
}

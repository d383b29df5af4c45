//! # Session Relay
//!
//! Owns everything that has invariants to protect: which connections belong to
//! which session, who the host is, and where an audio chunk must go next.
//!
//! ## Components:
//! - **session**: A single shared audio room and its transition rules
//! - **registry**: The keyed session table with per-id serialized mutation
//! - **coordinator**: Applies connection events to the registry and fans out results
//! - **hub**: Maps connection ids to live WebSocket actors (the production outbox)
//! - **protocol**: JSON wire messages exchanged with clients
//!
//! The coordinator never touches a socket. It only knows connection ids and hands
//! every outbound message to an [`outbox::Outbox`].

pub mod coordinator;
pub mod hub;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod session;

pub use coordinator::{Command, Membership, RelayCoordinator, RelaySettings};
pub use hub::ConnectionHub;
pub use session::{ConnectionId, SessionId};

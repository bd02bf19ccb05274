//! Studiolink discovery server.
//!
//! Serves the server half of the discovery protocol: peers connect over a
//! websocket, announce a role and optional project metadata, receive the
//! listing of everyone else, and relay negotiation payloads to each other
//! by peer id. See [`studiolink_wire::ClientOp`] and
//! [`studiolink_wire::ServerOp`] for the messages.

pub mod error;
pub mod server;

pub use error::{ServerError, ServerResult};
pub use server::DiscoveryServer;

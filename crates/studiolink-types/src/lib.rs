//! Core types for studiolink.
//!
//! This crate defines the data shared by every layer of the system: peer
//! identities and roles, the descriptive project metadata a peer publishes,
//! the connection state machine values, the error taxonomy and configuration.
//! It contains no I/O beyond reading the configuration file.

pub mod config;
pub mod error;
pub mod peer;

pub use config::{load_config, StudioLinkConfig};
pub use error::{ProtocolViolation, TransportError, TransportResult};
pub use peer::{
    check_role_pair, roles_compatible, AvailablePeer, ClientRole, ConnectionState, PeerId,
    ProjectMetadata, RequestData,
};

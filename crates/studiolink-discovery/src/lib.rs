//! Studiolink discovery.
//!
//! A [`DiscoveryMethod`] knows which remote peers are reachable through one
//! backend and is the only place transports are minted. The
//! [`ConnectionRegistry`] aggregates the methods of one process, validates
//! roles on every new connection and fans events out to the application.
//!
//! Two backends ship with the crate:
//!
//! - [`BrokerDiscovery`] against a [`LocalBroker`] shared by peers in the
//!   same process group, producing local-broker transports.
//! - [`SignalingDiscovery`] against a discovery server over a websocket,
//!   producing peer-to-peer transports negotiated through the server.

pub mod broker;
pub mod error;
pub mod listeners;
pub mod method;
pub mod registry;
pub mod signaling;
pub mod state;

pub use broker::{BrokerDiscovery, LocalBroker};
pub use error::{DiscoveryError, DiscoveryResult};
pub use listeners::{ListenerId, Listeners};
pub use method::{DiscoveryKind, DiscoveryMethod};
pub use registry::{ConnectionRegistry, ViolationListener};
pub use signaling::SignalingDiscovery;
pub use state::{ActiveConnection, DiscoveryCore};

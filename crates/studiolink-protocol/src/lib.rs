//! Studiolink command protocol.
//!
//! Applications describe every command once, in a [`ProtocolRegistry`]:
//! how the caller prepares the request, how the callee handles it, how the
//! caller reshapes the response and whether payloads travel as structured
//! values or as JSON text. A [`StudioConnection`] wraps one transport with
//! that catalog and exposes a single `call(name, args)`.

pub mod command;
pub mod connection;
pub mod error;
pub mod registry;

pub use command::{Payload, RegisteredCommand, SerializeCondition};
pub use connection::StudioConnection;
pub use error::{CommandError, CommandResult};
pub use registry::{validate_command_name, ProtocolRegistry};

//! Studiolink wire protocol.
//!
//! Turns any bidirectional message channel into a typed call interface.
//!
//! ## Architecture
//!
//! - **WireMessage**: request/response records discriminated by `direction`
//! - **Envelope**: a message plus the binary buffers transferred alongside it
//! - **CorrelationEngine**: assigns ids to outgoing calls, resolves them when
//!   the matching response arrives and runs local handlers for incoming calls
//! - **ErrorCodec**: how thrown handler errors cross the boundary
//! - **signaling**: the discovery-server protocol shared by client and server

pub mod codec;
pub mod engine;
pub mod error;
pub mod message;
pub mod signaling;

pub use codec::{DefaultErrorCodec, ErrorCodec, HandlerError};
pub use engine::{
    CallOptions, CorrelationEngine, EngineConfig, HandlerReply, Request, Response,
};
pub use error::{RemoteError, RpcError, RpcResult, WireError, WireResult};
pub use message::{decode_text, encode_text, Envelope, MessageBody, WireMessage};
pub use signaling::{ClientOp, ServerOp};

//! Wire protocol for slotkeeper.
//!
//! This crate defines what browsers and the server say to each other:
//!
//! - **Types** ([`ClientMessage`], [`ServerMessage`], [`ClientId`],
//!   [`SessionId`], ...): the JSON messages on the WebSocket.
//! - **Errors** ([`ErrorCode`], [`ErrorKind`]): the stable failure
//!   taxonomy, shared by the WebSocket and HTTP surfaces.
//! - **Codec** ([`Codec`], [`JsonCodec`]): bytes in, messages out.
//!
//! It knows nothing about connections, queues or processes.

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{ErrorCode, ErrorKind, ProtocolError};
pub use types::{
    ClientId, ClientMessage, EndReason, InviteReason, ServerMessage, SessionId,
};

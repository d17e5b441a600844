//! Peer wire protocol and per-peer request state.
//!
//! This module covers the post-handshake side of a peer: the message
//! codec, the session state machine, the double-buffered message writer,
//! and the request bookkeeping the scheduler operates on.

pub(crate) mod bitfield;
pub(crate) mod error;
pub(crate) mod message;
mod session;
pub mod state;
pub(crate) mod writer;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use message::{read_message, Message, MessageId, StandardCodec, WireCodec};
pub use session::PeerSession;
pub use state::{PeerId, PeerPieces, PeerRequestState, RequestError, UpdateReason};
pub use writer::MsgWriter;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::layout::Request;

/// Errors that close a peer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Contract violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A chunk arrived with no matching receive credit.
    #[error("received unexpected chunk {0:?}")]
    UnexpectedChunk(Request),

    /// A chunk's range lies outside its piece.
    #[error("chunk overflows piece: {0:?}")]
    ChunkOverflowsPiece(Request),

    /// A reject for a request we never made or already settled.
    #[error("invalid reject for {0:?}")]
    InvalidReject(Request),
}

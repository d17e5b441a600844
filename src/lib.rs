//! swarm-core - the download core of a BitTorrent client
//!
//! This library implements the piece-request scheduler, the peer-session
//! state machine and message I/O, and the chunk-receipt / piece-verification
//! pipeline that together drive multi-peer downloading. Metainfo parsing,
//! trackers, DHT and storage backends are external collaborators behind the
//! interfaces in [`storage`] and [`verify`].
//!
//! # Modules
//!
//! - [`layout`] - Piece/chunk geometry and the flat request-index mapping
//! - [`bitmap`] - Compressed, ordered bitmaps of request indices
//! - [`order`] - The global piece request order the scheduler walks
//! - [`scheduler`] - Desired-request computation and application
//! - [`peer`] - Wire messages, sessions, the message writer, request state
//! - [`webseed`] - BEP-19 HTTP range-fetch pseudo-peers
//! - [`torrent`] - Torrent state, the chunk receive pipeline, verification
//! - [`storage`] - The `ChunkStorage` interface to storage backends
//! - [`verify`] - Piece hash verification
//! - [`sync`] - The deferred-action torrent lock and its condition variable
//! - [`stats`] - Monotonic transfer counters

pub mod bitmap;
pub mod constants;
pub mod layout;
pub mod order;
pub mod peer;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod sync;
pub mod torrent;
pub mod verify;
pub mod webseed;

pub use bitmap::RequestBitmap;
pub use layout::{ChunkSpec, Layout, PieceIndex, Request, RequestIndex};
pub use order::{OrderKey, OrderState, PieceRequestOrder, Priority};
pub use peer::{
    Bitfield, Message, MsgWriter, PeerError, PeerId, PeerSession, StandardCodec, WireCodec,
};
pub use scheduler::DesiredState;
pub use stats::ConnStats;
pub use storage::{ChunkStorage, Completion, MemoryStorage, StorageError};
pub use sync::{DeferKey, DeferredRwLock, Event};
pub use torrent::{Config, PeerLink, PieceState, PieceStateEvent, Torrent};
pub use verify::{Sha1Verifier, Verifier};
pub use webseed::{HttpFetcher, RangeFetcher, Webseed, WebseedError};

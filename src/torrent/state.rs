//! Mutable torrent state, guarded by the torrent lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::bitmap::RequestBitmap;
use crate::layout::{PieceIndex, Request, RequestIndex};
use crate::order::PieceRequestOrder;
use crate::peer::bitfield::Bitfield;
use crate::peer::state::{PeerId, PeerRequestState};
use crate::stats::ConnStats;
use crate::torrent::piece::Piece;

/// The transport side of a peer, as seen by the scheduler and the receive
/// pipeline. Wire connections and webseeds implement this; everything else
/// about them is invisible here.
///
/// Methods are called under the torrent lock and must not block.
pub trait PeerLink: Send + Sync {
    /// Queues an Interested or NotInterested message.
    fn send_interested(&self, interested: bool);

    /// Queues a Request.
    fn send_request(&self, r: Request);

    /// Queues a Cancel. Returns true if the transport acknowledges cancels,
    /// in which case the request waits in `cancelled` until acked or
    /// rejected.
    fn send_cancel(&self, r: Request) -> bool;

    /// Announces a newly verified piece.
    fn send_have(&self, piece: PieceIndex);

    /// Wakes whatever drains this peer's request set (message writer,
    /// webseed requester pool). Must not block.
    fn wake(&self);

    /// The peer is being dropped from the torrent.
    fn on_close(&self);

    /// Short connection-kind tag for status lines.
    fn flags(&self) -> &'static str;
}

/// The single live owner of an outstanding request index.
#[derive(Debug, Clone, Copy)]
pub struct RequestOwner {
    pub peer: PeerId,
    pub since: Instant,
}

/// A peer registered with the torrent.
pub struct PeerRecord {
    pub state: PeerRequestState,
    pub link: Arc<dyn PeerLink>,
    pub stats: Arc<ConnStats>,
    /// When the peer last hit an error nobody handled; polled by clients.
    pub last_unhandled_err: Option<Instant>,
}

/// Everything mutable about a torrent. One writer at a time, via the
/// deferred torrent lock.
pub struct TorrentState {
    pub(crate) pieces: Vec<Piece>,
    /// Pieces with priority above None that are incomplete and requestable.
    pub(crate) pending_pieces: RequestBitmap,
    /// Chunks received (or being written) torrent-wide, by request index.
    /// A dirty chunk is not requested again.
    pub(crate) dirty_chunks: RequestBitmap,
    pub(crate) completed: Bitfield,
    /// Live request ownership; at most one writer per request index.
    pub(crate) request_state: HashMap<RequestIndex, RequestOwner>,
    pub(crate) peers: HashMap<PeerId, PeerRecord>,
    pub(crate) order: PieceRequestOrder,
    pub(crate) closed: bool,
    /// Storage reported closed; no new requests are driven.
    pub(crate) storage_broken: bool,
    pub(crate) next_peer_id: u64,
}

impl TorrentState {
    pub(crate) fn new(piece_count: usize, pieces: Vec<Piece>) -> Self {
        Self {
            pieces,
            pending_pieces: RequestBitmap::new(),
            dirty_chunks: RequestBitmap::new(),
            completed: Bitfield::new(piece_count),
            request_state: HashMap::new(),
            peers: HashMap::new(),
            order: PieceRequestOrder::new(),
            closed: false,
            storage_broken: false,
            next_peer_id: 0,
        }
    }

    pub(crate) fn peer(&self, peer: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&peer)
    }

    pub(crate) fn peer_mut(&mut self, peer: PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&peer)
    }

    /// The peer currently owning a live request, if any.
    pub(crate) fn requesting_peer(&self, r: RequestIndex) -> Option<PeerId> {
        self.request_state.get(&r).map(|o| o.peer)
    }
}

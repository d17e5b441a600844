//! Per-peer request state.
//!
//! Everything here is mutated only under the torrent lock. The scheduler
//! reads and rewrites `requests`; the session and receive pipeline settle
//! entries as chunks, rejects and cancel acks arrive.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::bitmap::RequestBitmap;
use crate::constants::{DEFAULT_PEER_MAX_REQUESTS, MAX_LOCAL_TO_REMOTE_REQUESTS};
use crate::layout::{PieceIndex, RequestIndex};
use crate::peer::bitfield::Bitfield;

/// Identifies a peer within one torrent for the life of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// Why a request update was triggered. The first reason set wins until the
/// update runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    OwnChokeChanged,
    PeerChoked,
    PeerUnchoked,
    Have,
    Bitfield,
    AllowedFast,
    PriorityChange,
    PieceCompleted,
    HashCompleted,
    Cancel,
    RemoteReject,
    ReceivedChunk,
    OrderReshape,
    WriteError,
    PeerClosed,
    Timer,
}

/// Why a request may not be issued to a peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("too many outstanding requests")]
    TooManyOutstanding,

    #[error("request is cancelled and awaiting acknowledgement")]
    AlreadyCancelled,

    #[error("peer does not have the piece")]
    PeerLacksPiece,

    #[error("piece is hashing or queued for hash")]
    PieceHashing,

    #[error("peer is choking and piece is not allowed fast")]
    PeerChokingNotFast,

    #[error("chunk already present or pending write")]
    ChunkAlreadyHeld,
}

/// What the remote claims to have.
///
/// A peer that sent HaveAll before we knew the piece count carries an empty
/// bitfield with the flag set; once the geometry is known it counts as
/// having every piece.
#[derive(Debug, Clone)]
pub struct PeerPieces {
    have_all: bool,
    bits: Bitfield,
}

impl PeerPieces {
    pub fn new(piece_count: usize) -> Self {
        Self {
            have_all: false,
            bits: Bitfield::new(piece_count),
        }
    }

    pub fn set_have_all(&mut self) {
        self.have_all = true;
    }

    pub fn set_have_none(&mut self) {
        self.have_all = false;
        self.bits = Bitfield::new(self.bits.piece_count());
    }

    pub fn set_bitfield(&mut self, bits: Bitfield) {
        self.have_all = false;
        self.bits = bits;
    }

    pub fn set(&mut self, piece: PieceIndex) {
        self.bits.set(piece as usize);
    }

    pub fn has_all(&self) -> bool {
        self.have_all
    }

    pub fn has(&self, piece: PieceIndex) -> bool {
        self.have_all || self.bits.has(piece as usize)
    }

    /// How many pieces the peer has, given the torrent's piece count.
    pub fn count(&self, piece_count: usize) -> usize {
        if self.have_all {
            piece_count
        } else {
            self.bits.count()
        }
    }

    /// The underlying explicit bitfield (HaveAll not expanded).
    pub fn bits(&self) -> &Bitfield {
        &self.bits
    }
}

/// Request-related state for one peer.
#[derive(Debug)]
pub struct PeerRequestState {
    /// Outstanding requests, iterated in request-index order.
    pub requests: RequestBitmap,
    /// Requests we sent a Cancel for and still expect an ack or reject for.
    pub cancelled: RequestBitmap,
    /// Receive credits per request index. May exceed one across re-requests
    /// and endgame duplicates.
    pub valid_receive_chunks: HashMap<RequestIndex, u32>,
    /// Whether we told the peer we are interested.
    pub interested: bool,
    /// Whether the peer is choking us.
    pub peer_choking: bool,
    /// Whether we are choking the peer.
    pub am_choking: bool,
    /// Whether the peer is interested in us.
    pub peer_interested: bool,
    /// Pieces the peer lets us request while choked (BEP-6).
    pub allowed_fast: HashSet<PieceIndex>,
    /// Pieces the peer claims to have.
    pub pieces: PeerPieces,
    /// High-water mark of concurrent outstanding requests.
    pub peak_requests: u32,
    /// The peer's advertised request queue limit.
    pub peer_max_requests: u32,
    /// Pending scheduler trigger, if any.
    pub need_request_update: Option<UpdateReason>,
    /// Pieces we have accepted chunks from this peer for.
    pub touched_pieces: HashSet<PieceIndex>,
    /// Peer vouched for out-of-band (e.g. came from a trusted source).
    pub trusted: bool,

    last_became_interested: Option<Instant>,
    prior_interest: Duration,
    last_started_expecting: Option<Instant>,
    cumulative_expected: Duration,
}

impl PeerRequestState {
    pub fn new(piece_count: usize) -> Self {
        Self {
            requests: RequestBitmap::new(),
            cancelled: RequestBitmap::new(),
            valid_receive_chunks: HashMap::new(),
            interested: false,
            peer_choking: true,
            am_choking: true,
            peer_interested: false,
            allowed_fast: HashSet::new(),
            pieces: PeerPieces::new(piece_count),
            peak_requests: 0,
            peer_max_requests: DEFAULT_PEER_MAX_REQUESTS,
            need_request_update: None,
            touched_pieces: HashSet::new(),
            trusted: false,
            last_became_interested: None,
            prior_interest: Duration::ZERO,
            last_started_expecting: None,
            cumulative_expected: Duration::ZERO,
        }
    }

    /// The effective cap on outstanding requests: the peer's advertised
    /// limit, twice the observed peak (so pipelines grow gradually), and
    /// what fits in the write buffer.
    pub fn nominal_max_requests(&self) -> u32 {
        self.peer_max_requests
            .min(self.peak_requests.saturating_mul(2))
            .min(MAX_LOCAL_TO_REMOTE_REQUESTS)
            .max(1)
    }

    /// Drained both the outstanding and the awaiting-ack sets.
    pub fn is_low_on_requests(&self) -> bool {
        self.requests.is_empty() && self.cancelled.is_empty()
    }

    /// The peer may serve this piece right now.
    pub fn can_request_piece(&self, piece: PieceIndex) -> bool {
        self.pieces.has(piece) && (!self.peer_choking || self.allowed_fast.contains(&piece))
    }

    /// Grants one receive credit for a request index.
    pub fn inc_receive_credit(&mut self, r: RequestIndex) {
        *self.valid_receive_chunks.entry(r).or_insert(0) += 1;
    }

    /// Consumes one receive credit; false if none remained.
    pub fn dec_receive_credit(&mut self, r: RequestIndex) -> bool {
        match self.valid_receive_chunks.get_mut(&r) {
            Some(1) => {
                self.valid_receive_chunks.remove(&r);
                true
            }
            Some(count) => {
                *count -= 1;
                true
            }
            None => false,
        }
    }

    pub fn receive_credits(&self, r: RequestIndex) -> u32 {
        self.valid_receive_chunks.get(&r).copied().unwrap_or(0)
    }

    pub fn dec_peak_requests(&mut self) {
        self.peak_requests = self.peak_requests.saturating_sub(1);
    }

    /// Updates interest and returns whether the flag changed.
    pub fn set_interested(&mut self, interested: bool) -> bool {
        if self.interested == interested {
            return false;
        }
        self.interested = interested;
        if interested {
            self.last_became_interested = Some(Instant::now());
        } else if let Some(since) = self.last_became_interested.take() {
            self.prior_interest += since.elapsed();
        }
        self.update_expecting_chunks();
        true
    }

    /// Whether we reasonably expect chunks to be in flight from this peer.
    pub fn expecting_chunks(&self) -> bool {
        if self.requests.is_empty() || !self.interested {
            return false;
        }
        if !self.peer_choking {
            return true;
        }
        // Choked: only allowed-fast requests can still be answered.
        !self.allowed_fast.is_empty()
    }

    /// Re-evaluates the expecting-chunks clock. Call after any change to
    /// requests, interest or choke state.
    pub fn update_expecting_chunks(&mut self) {
        if self.expecting_chunks() {
            if self.last_started_expecting.is_none() {
                self.last_started_expecting = Some(Instant::now());
            }
        } else if let Some(since) = self.last_started_expecting.take() {
            self.cumulative_expected += since.elapsed();
        }
    }

    /// Total time spent expecting chunks; the denominator for the download
    /// rate.
    pub fn total_expecting_time(&self) -> Duration {
        let mut ret = self.cumulative_expected;
        if let Some(since) = self.last_started_expecting {
            ret += since.elapsed();
        }
        ret
    }

    /// Bytes per second over the lifetime of the connection.
    pub fn download_rate(&self, bytes_read_useful: u64) -> f64 {
        if bytes_read_useful == 0 {
            return 0.0;
        }
        let secs = self.total_expecting_time().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        bytes_read_useful as f64 / secs
    }
}

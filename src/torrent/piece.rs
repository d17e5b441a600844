//! Per-piece dynamic state.

use std::collections::HashSet;

use crate::order::Priority;
use crate::peer::state::PeerId;
use crate::verify::PieceHash;

/// Mutable state of one piece. Chunk-level dirtiness lives in the torrent's
/// request-index bitmap; this struct carries everything piece-granular.
#[derive(Debug)]
pub struct Piece {
    pub priority: Priority,
    /// Count of peers that have the piece.
    pub availability: u32,
    /// A verification job is running.
    pub hashing: bool,
    /// A verification job is queued but not yet running.
    pub queued_for_hash: bool,
    /// Post-hash completion commit in progress.
    pub marking: bool,
    /// Storage reported the piece complete at the last completion read.
    pub storage_completion_ok: bool,
    /// Times this piece has been hashed.
    pub num_verifies: u64,
    /// Chunk writes currently in flight.
    pub pending_writes: u32,
    /// Peers whose chunks are in the current piece content; blamed on hash
    /// failure.
    pub dirtiers: HashSet<PeerId>,
    /// Expected hash from the metainfo.
    pub expected_hash: PieceHash,
}

impl Piece {
    pub fn new(expected_hash: PieceHash) -> Self {
        Self {
            priority: Priority::Normal,
            availability: 0,
            hashing: false,
            queued_for_hash: false,
            marking: false,
            storage_completion_ok: false,
            num_verifies: 0,
            pending_writes: 0,
            dirtiers: HashSet::new(),
            expected_hash,
        }
    }

    /// The piece is in a verification stage and must not be requested.
    pub fn checking(&self) -> bool {
        self.hashing || self.queued_for_hash || self.marking
    }
}

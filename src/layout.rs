//! Static mapping between byte ranges, pieces, chunks, and request indices.
//!
//! A torrent of `total_length` bytes is split into pieces of `piece_length`
//! bytes (the last piece may be shorter), and each piece into chunks of
//! `chunk_size` bytes (the last chunk of the last piece may be shorter).
//! The *request index* is a flat numbering over all chunks in the torrent,
//! which lets request tracking use compact bitmaps instead of per-piece maps.

/// Index of a piece within the torrent.
pub type PieceIndex = u32;

/// Flat index of a chunk across the whole torrent.
pub type RequestIndex = u32;

/// Standard chunk size (16KB).
pub const DEFAULT_CHUNK_SIZE: u32 = 16384;

/// A request for a chunk of piece data, as carried by Request, Cancel and
/// Reject messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    /// The piece index.
    pub piece: PieceIndex,
    /// Byte offset within the piece.
    pub begin: u32,
    /// Length of the chunk in bytes.
    pub length: u32,
}

impl Request {
    /// Creates a new request.
    pub fn new(piece: PieceIndex, begin: u32, length: u32) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }
}

/// Offset and length of a chunk within its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub begin: u32,
    pub length: u32,
}

/// Returns true if any part of the chunk would lie outside a piece of the
/// given length. Also catches `begin + length` overflowing `u32`.
pub fn chunk_overflows_piece(spec: ChunkSpec, piece_length: u32) -> bool {
    match spec.begin.checked_add(spec.length) {
        Some(end) => end > piece_length,
        None => true,
    }
}

/// Precomputed piece/chunk geometry for one torrent.
///
/// All lookups are O(1) or O(log N); the inverse request-index mapping uses a
/// binary search over the chunk-offset prefix table.
#[derive(Debug, Clone)]
pub struct Layout {
    total_length: u64,
    piece_length: u32,
    chunk_size: u32,
    piece_count: u32,
    // chunk_offsets[i] is the request index of the first chunk of piece i;
    // chunk_offsets[piece_count] is the total number of request indices.
    chunk_offsets: Vec<RequestIndex>,
}

impl Layout {
    /// Builds the layout for a torrent.
    ///
    /// A `total_length` of zero produces a layout with no pieces and no
    /// request indices.
    pub fn new(total_length: u64, piece_length: u32, chunk_size: u32) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        let piece_count = if piece_length == 0 {
            0
        } else {
            total_length.div_ceil(piece_length as u64) as u32
        };
        let mut chunk_offsets = Vec::with_capacity(piece_count as usize + 1);
        let mut offset: RequestIndex = 0;
        chunk_offsets.push(0);
        for i in 0..piece_count {
            let piece_len = Self::piece_length_at(total_length, piece_length, piece_count, i);
            offset += piece_len.div_ceil(chunk_size);
            chunk_offsets.push(offset);
        }
        Self {
            total_length,
            piece_length,
            chunk_size,
            piece_count,
            chunk_offsets,
        }
    }

    fn piece_length_at(total: u64, piece_length: u32, count: u32, index: u32) -> u32 {
        if index + 1 < count {
            piece_length
        } else {
            let remainder = total % piece_length as u64;
            if remainder == 0 {
                piece_length
            } else {
                remainder as u32
            }
        }
    }

    /// Total torrent length in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Nominal piece length in bytes.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Length of a specific piece (the last piece may be shorter).
    pub fn piece_length_of(&self, piece: PieceIndex) -> u32 {
        assert!(piece < self.piece_count, "piece index out of range");
        Self::piece_length_at(
            self.total_length,
            self.piece_length,
            self.piece_count,
            piece,
        )
    }

    /// Number of chunks in a specific piece.
    pub fn chunks_in(&self, piece: PieceIndex) -> u32 {
        self.chunk_offsets[piece as usize + 1] - self.chunk_offsets[piece as usize]
    }

    /// Request index of the first chunk of a piece.
    pub fn request_index_offset(&self, piece: PieceIndex) -> RequestIndex {
        self.chunk_offsets[piece as usize]
    }

    /// One past the request index of the last chunk of a piece.
    pub fn request_index_end(&self, piece: PieceIndex) -> RequestIndex {
        self.chunk_offsets[piece as usize + 1]
    }

    /// Total number of request indices in the torrent.
    pub fn num_request_indices(&self) -> u32 {
        *self.chunk_offsets.last().unwrap_or(&0)
    }

    /// The piece a request index belongs to.
    pub fn piece_of(&self, r: RequestIndex) -> PieceIndex {
        debug_assert!(r < self.num_request_indices());
        // partition_point returns the first offset > r; the piece is one before.
        self.chunk_offsets.partition_point(|&off| off <= r) as u32 - 1
    }

    /// The chunk index of a request index within its piece.
    pub fn chunk_of(&self, r: RequestIndex) -> u32 {
        r - self.request_index_offset(self.piece_of(r))
    }

    /// Maps `(piece, begin)` to a request index. `begin` must be a multiple
    /// of the chunk size.
    pub fn request_index_of(&self, piece: PieceIndex, begin: u32) -> RequestIndex {
        debug_assert_eq!(begin % self.chunk_size, 0, "begin not chunk aligned");
        self.request_index_offset(piece) + begin / self.chunk_size
    }

    /// Offset and length of the chunk identified by a request index.
    pub fn chunk_spec(&self, r: RequestIndex) -> ChunkSpec {
        let piece = self.piece_of(r);
        let chunk = r - self.request_index_offset(piece);
        let begin = chunk * self.chunk_size;
        let piece_len = self.piece_length_of(piece);
        let length = (piece_len - begin).min(self.chunk_size);
        ChunkSpec { begin, length }
    }

    /// The wire request corresponding to a request index.
    pub fn request(&self, r: RequestIndex) -> Request {
        let piece = self.piece_of(r);
        let spec = self.chunk_spec(r);
        Request {
            piece,
            begin: spec.begin,
            length: spec.length,
        }
    }

    /// Maps a wire request back to its request index.
    pub fn request_index(&self, req: &Request) -> RequestIndex {
        self.request_index_of(req.piece, req.begin)
    }

    /// Absolute byte offset of a request within the torrent.
    pub fn request_offset(&self, req: &Request) -> u64 {
        req.piece as u64 * self.piece_length as u64 + req.begin as u64
    }

    /// Validates a wire request against the piece geometry.
    pub fn valid_request(&self, req: &Request) -> bool {
        if req.piece >= self.piece_count {
            return false;
        }
        if req.begin % self.chunk_size != 0 || req.length == 0 || req.length > self.chunk_size {
            return false;
        }
        !chunk_overflows_piece(
            ChunkSpec {
                begin: req.begin,
                length: req.length,
            },
            self.piece_length_of(req.piece),
        )
    }
}

//! Tuning parameters.
//!
//! Defaults follow libtorrent and the mainline clients where a comparable
//! knob exists.

use std::time::Duration;

/// Standard chunk (block) size, 16KB.
pub const CHUNK_SIZE: u32 = 16384;

/// Maximum request length per BEP-3 (128KB). Larger requests are suspicious.
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Maximum pending requests we honor from a remote peer.
pub const LOCAL_REQUEST_QUEUE: usize = 256;

/// Default maximum outstanding requests a peer allows us, before the peer
/// advertises its own limit.
pub const DEFAULT_PEER_MAX_REQUESTS: u32 = 250;

/// Write buffer high-water mark. The writer stops filling past this.
pub const WRITE_BUFFER_HIGH_WATER: usize = 1 << 17; // 128KB

/// Write buffer low-water mark.
pub const WRITE_BUFFER_LOW_WATER: usize = WRITE_BUFFER_HIGH_WATER / 2;

/// Encoded length of an Interested message.
pub const INTERESTED_MSG_LEN: usize = 5;

/// Encoded length of a Request message.
pub const REQUEST_MSG_LEN: usize = 17;

/// The most requests that fit in the write buffer when it is at or below
/// the low-water mark when the scheduler runs.
pub const MAX_LOCAL_TO_REMOTE_REQUESTS: u32 =
    ((WRITE_BUFFER_HIGH_WATER - WRITE_BUFFER_LOW_WATER - INTERESTED_MSG_LEN) / REQUEST_MSG_LEN)
        as u32;

/// Minimum gap between write-buffer fill passes; coalesces bursts.
pub const MIN_FILL_GAP: Duration = Duration::from_millis(10);

/// Keep-alive message interval.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval of the per-peer request update timer.
pub const UPDATE_REQUESTS_INTERVAL: Duration = Duration::from_secs(3);

/// Remaining-piece threshold for endgame mode.
pub const ENDGAME_PIECES_THRESHOLD: u64 = 10;

/// Age at which another peer's outstanding request may be stolen when the
/// peers otherwise rank equal.
pub const REQUEST_STALE: Duration = Duration::from_secs(20);

/// Webseed HTTP connect timeout.
pub const WEBSEED_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Webseed HTTP read timeout.
pub const WEBSEED_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default webseed requester pool size.
pub const WEBSEED_DEFAULT_WORKERS: usize = 4;

/// Upper bound on the webseed requester pool size.
pub const WEBSEED_MAX_WORKERS: usize = 16;

/// Most adjacent chunks coalesced into one webseed range fetch.
pub const WEBSEED_COALESCE_CHUNKS: u32 = 8;

/// Cap on the randomized webseed retry back-off.
pub const WEBSEED_BACKOFF_MAX: Duration = Duration::from_secs(10);

use std::time::Duration;

use crate::constants::{
    CHUNK_SIZE, ENDGAME_PIECES_THRESHOLD, KEEP_ALIVE_TIMEOUT, UPDATE_REQUESTS_INTERVAL,
    WEBSEED_DEFAULT_WORKERS,
};

/// Torrent tuning knobs. Loading these from files or flags is the caller's
/// concern.
#[derive(Debug, Clone)]
pub struct Config {
    /// Chunk size used for request geometry.
    pub chunk_size: u32,
    /// Idle interval after which a keep-alive is written.
    pub keep_alive_timeout: Duration,
    /// Interval of the per-peer request-update coalescing timer.
    pub update_requests_interval: Duration,
    /// Remaining-pending-piece count at which endgame duplicates are allowed.
    pub endgame_pieces_threshold: u64,
    /// Worker count for each webseed.
    pub webseed_workers: usize,
    /// Enables the debug subset of counters.
    pub debug_metrics: bool,
    /// Skips verification of pieces storage reports complete at startup.
    pub disable_initial_piece_check: bool,
    /// Does not count stored completion into `completed_pieces` until the
    /// piece has been verified at least once.
    pub ignore_unverified_piece_completion: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
            update_requests_interval: UPDATE_REQUESTS_INTERVAL,
            endgame_pieces_threshold: ENDGAME_PIECES_THRESHOLD,
            webseed_workers: WEBSEED_DEFAULT_WORKERS,
            debug_metrics: false,
            disable_initial_piece_check: false,
            ignore_unverified_piece_completion: false,
        }
    }
}

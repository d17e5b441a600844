//! Connection and torrent statistics.
//!
//! Counters are monotonic atomics so they can be bumped from any task
//! without the torrent lock. The same struct is instantiated per peer and
//! per torrent; receive paths bump both. A debug-metrics subset is gated by
//! a single flag on [`crate::torrent::Config`].

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Aggregated transfer counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    /// All bytes read off the transport, including waste.
    pub bytes_read: Counter,
    /// Chunk payload bytes we still wanted on arrival.
    pub bytes_read_useful: Counter,
    /// Useful bytes that answered a request still in our outstanding set.
    pub bytes_read_useful_intended: Counter,
    /// Chunk messages received.
    pub chunks_read: Counter,
    /// Chunk messages that were still wanted.
    pub chunks_read_useful: Counter,
    /// Chunks received for already-complete pieces.
    pub chunks_read_wasted: Counter,
    /// Chunks received with no matching receive credit.
    pub chunks_read_unexpected: Counter,
    /// Chunks successfully handed to storage.
    pub chunks_written: Counter,
    /// Pieces this connection contributed to that verified good.
    pub pieces_dirtied_good: Counter,
    /// Pieces this connection contributed to that failed verification.
    pub pieces_dirtied_bad: Counter,
    /// Keep-alive messages written. Debug metric.
    pub written_keepalives: Counter,
}

impl ConnStats {
    /// Counts a received chunk of `len` payload bytes.
    pub fn received_chunk(&self, len: u64) {
        self.chunks_read.inc();
        self.bytes_read.add(len);
    }

    /// Good minus bad pieces dirtied; the trust signal used when deciding
    /// whether to steal a request from another peer.
    pub fn net_good_pieces_dirtied(&self) -> i64 {
        self.pieces_dirtied_good.get() as i64 - self.pieces_dirtied_bad.get() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ConnStats::default();
        stats.received_chunk(16384);
        stats.received_chunk(100);
        assert_eq!(stats.chunks_read.get(), 2);
        assert_eq!(stats.bytes_read.get(), 16484);
    }

    #[test]
    fn test_net_good_pieces_dirtied() {
        let stats = ConnStats::default();
        stats.pieces_dirtied_good.add(2);
        stats.pieces_dirtied_bad.add(5);
        assert_eq!(stats.net_good_pieces_dirtied(), -3);
    }
}

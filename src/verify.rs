//! Piece hash verification.
//!
//! The verifier is opaque to the download core: it reads a piece back from
//! storage and produces a hash that is compared against the expected value
//! from the metainfo. The default implementation is SHA-1 (BitTorrent v1).

use std::io::{self, Read};

use sha1::{Digest, Sha1};

use crate::layout::PieceIndex;

/// A 20-byte piece hash.
pub type PieceHash = [u8; 20];

/// Computes piece hashes from stored data.
pub trait Verifier: Send + Sync {
    fn hash_piece(&self, piece: PieceIndex, reader: &mut dyn Read) -> io::Result<PieceHash>;
}

/// SHA-1 piece hashing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Verifier;

impl Verifier for Sha1Verifier {
    fn hash_piece(&self, _piece: PieceIndex, reader: &mut dyn Read) -> io::Result<PieceHash> {
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 16384];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }
}

/// Hashes a byte slice the way [`Sha1Verifier`] hashes a piece. Handy for
/// building expected-hash tables in tests and torrent creation.
pub fn sha1_hash(data: &[u8]) -> PieceHash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

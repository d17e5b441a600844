//! Storage interface for piece data.
//!
//! Backends (file, mmap, database) live outside this crate; the download
//! core only needs the operations below. Backends serialize their own
//! internal state; the torrent guarantees at most one in-flight write per
//! chunk via `pending_writes` accounting.

use std::io::{self, Read};

use parking_lot::Mutex;
use thiserror::Error;

use crate::layout::PieceIndex;

/// Errors surfaced by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend has been closed; stop driving new requests.
    #[error("storage closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Stored completion state of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Complete,
    Incomplete,
    /// The backend does not track completion for this piece.
    Unknown,
}

/// Chunk-granular storage for one torrent.
///
/// All methods are called with the torrent lock released.
pub trait ChunkStorage: Send + Sync {
    /// Reads up to `buf.len()` bytes of piece data starting at `offset`.
    fn read_at(&self, piece: PieceIndex, offset: u32, buf: &mut [u8])
        -> Result<usize, StorageError>;

    /// Writes one chunk of piece data.
    fn write_chunk(&self, piece: PieceIndex, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Stored completion state for the piece.
    fn completion(&self, piece: PieceIndex) -> Result<Completion, StorageError>;

    /// Records that the piece verified good.
    fn mark_complete(&self, piece: PieceIndex) -> Result<(), StorageError>;

    /// Records that the piece is no longer complete (hash failure).
    fn mark_incomplete(&self, piece: PieceIndex) -> Result<(), StorageError>;

    /// Flushes buffered writes.
    fn flush(&self) -> Result<(), StorageError>;

    /// Whether completion marks survive restarts; durable backends get a
    /// flush after each `mark_complete`.
    fn is_durable(&self) -> bool {
        false
    }
}

/// A sequential reader over one piece, for verification.
pub struct PieceReader<'a> {
    storage: &'a dyn ChunkStorage,
    piece: PieceIndex,
    offset: u32,
    length: u32,
}

impl<'a> PieceReader<'a> {
    pub fn new(storage: &'a dyn ChunkStorage, piece: PieceIndex, length: u32) -> Self {
        Self {
            storage,
            piece,
            offset: 0,
            length,
        }
    }
}

impl Read for PieceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = (self.length - self.offset) as usize;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = remaining.min(buf.len());
        let n = self
            .storage
            .read_at(self.piece, self.offset, &mut buf[..want])
            .map_err(|e| match e {
                StorageError::Io(io) => io,
                other => io::Error::other(other.to_string()),
            })?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short piece read",
            ));
        }
        self.offset += n as u32;
        Ok(n)
    }
}

/// In-memory storage, used by tests and small transfers.
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    pieces: Vec<Vec<u8>>,
    complete: Vec<bool>,
    closed: bool,
}

impl MemoryStorage {
    /// Allocates zeroed storage; `piece_lengths[i]` is the byte length of
    /// piece `i`.
    pub fn new(piece_lengths: &[u32]) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                pieces: piece_lengths.iter().map(|&l| vec![0; l as usize]).collect(),
                complete: vec![false; piece_lengths.len()],
                closed: false,
            }),
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Copy of a piece's current contents.
    pub fn piece_data(&self, piece: PieceIndex) -> Vec<u8> {
        self.inner.lock().pieces[piece as usize].clone()
    }
}

impl ChunkStorage for MemoryStorage {
    fn read_at(
        &self,
        piece: PieceIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let data = inner
            .pieces
            .get(piece as usize)
            .ok_or_else(|| StorageError::Io(io::Error::other("piece out of range")))?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_chunk(&self, piece: PieceIndex, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let dest = inner
            .pieces
            .get_mut(piece as usize)
            .ok_or_else(|| StorageError::Io(io::Error::other("piece out of range")))?;
        let offset = offset as usize;
        if offset + data.len() > dest.len() {
            return Err(StorageError::Io(io::Error::other("chunk out of bounds")));
        }
        dest[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn completion(&self, piece: PieceIndex) -> Result<Completion, StorageError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        match inner.complete.get(piece as usize) {
            Some(true) => Ok(Completion::Complete),
            Some(false) => Ok(Completion::Incomplete),
            None => Ok(Completion::Unknown),
        }
    }

    fn mark_complete(&self, piece: PieceIndex) -> Result<(), StorageError> {
        self.inner.lock().complete[piece as usize] = true;
        Ok(())
    }

    fn mark_incomplete(&self, piece: PieceIndex) -> Result<(), StorageError> {
        self.inner.lock().complete[piece as usize] = false;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new(&[32, 16]);
        storage.write_chunk(0, 0, &[1; 16]).unwrap();
        storage.write_chunk(0, 16, &[2; 16]).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(storage.read_at(0, 0, &mut buf).unwrap(), 32);
        assert_eq!(&buf[..16], &[1; 16]);
        assert_eq!(&buf[16..], &[2; 16]);
    }

    #[test]
    fn test_completion_marks() {
        let storage = MemoryStorage::new(&[16]);
        assert_eq!(storage.completion(0).unwrap(), Completion::Incomplete);
        storage.mark_complete(0).unwrap();
        assert_eq!(storage.completion(0).unwrap(), Completion::Complete);
        storage.mark_incomplete(0).unwrap();
        assert_eq!(storage.completion(0).unwrap(), Completion::Incomplete);
    }

    #[test]
    fn test_closed_storage_errors() {
        let storage = MemoryStorage::new(&[16]);
        storage.close();
        assert!(matches!(
            storage.write_chunk(0, 0, &[0; 16]),
            Err(StorageError::Closed)
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            storage.read_at(0, 0, &mut buf),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn test_piece_reader() {
        let storage = MemoryStorage::new(&[40]);
        storage
            .write_chunk(0, 0, &(0..40).collect::<Vec<u8>>())
            .unwrap();
        let mut reader = PieceReader::new(&storage, 0, 40);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, (0..40).collect::<Vec<u8>>());
    }
}

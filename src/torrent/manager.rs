//! The torrent: shared state, the chunk receive pipeline, verification
//! jobs, and the triggers that keep the request order and the per-peer
//! schedulers in sync.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::layout::{Layout, PieceIndex, Request, RequestIndex};
use crate::order::{OrderKey, OrderState, Priority};
use crate::peer::bitfield::Bitfield;
use crate::peer::error::PeerError;
use crate::peer::state::{PeerId, PeerRequestState, UpdateReason};
use crate::scheduler;
use crate::stats::ConnStats;
use crate::storage::{ChunkStorage, Completion, PieceReader, StorageError};
use crate::sync::{DeferredRwLock, Event, WriteGuard};
use crate::torrent::config::Config;
use crate::torrent::piece::Piece;
use crate::torrent::state::{PeerLink, PeerRecord, TorrentState};
use crate::verify::{PieceHash, Verifier};

/// Published piece lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Pending,
    Partial,
    QueuedForCheck,
    Checking,
    Complete,
    Bad,
}

/// A piece state change, broadcast to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceStateEvent {
    pub piece: PieceIndex,
    pub state: PieceState,
}

type WriteChunkErrHook = Box<dyn Fn(&StorageError) + Send + Sync>;

/// One torrent's download core.
pub struct Torrent {
    layout: Layout,
    config: Config,
    pub(crate) lock: DeferredRwLock<TorrentState>,
    pub(crate) event: Event,
    storage: Arc<dyn ChunkStorage>,
    verifier: Arc<dyn Verifier>,
    stats: Arc<ConnStats>,
    state_events: broadcast::Sender<PieceStateEvent>,
    on_write_chunk_err: Mutex<Option<WriteChunkErrHook>>,
}

impl Torrent {
    /// Creates the torrent and reads stored completion for every piece.
    ///
    /// Unless `disable_initial_piece_check` is set, pieces storage reports
    /// complete are queued for verification (requires a tokio runtime).
    /// With `ignore_unverified_piece_completion`, stored completion is not
    /// counted until a verify has confirmed it.
    pub fn new(
        layout: Layout,
        hashes: Vec<PieceHash>,
        storage: Arc<dyn ChunkStorage>,
        verifier: Arc<dyn Verifier>,
        config: Config,
    ) -> Arc<Self> {
        assert_eq!(
            hashes.len(),
            layout.piece_count() as usize,
            "one expected hash per piece"
        );
        let pieces: Vec<Piece> = hashes.into_iter().map(Piece::new).collect();
        let piece_count = layout.piece_count() as usize;
        let (state_events, _) = broadcast::channel(256);
        let torrent = Arc::new(Self {
            layout,
            config,
            lock: DeferredRwLock::new("torrent", TorrentState::new(piece_count, pieces)),
            event: Event::new(),
            storage,
            verifier,
            stats: Arc::new(ConnStats::default()),
            state_events,
            on_write_chunk_err: Mutex::new(None),
        });
        torrent.initial_completion_scan();
        torrent
    }

    fn initial_completion_scan(self: &Arc<Self>) {
        let mut recheck = Vec::new();
        {
            let mut g = self.lock.write();
            for i in 0..self.layout.piece_count() {
                let completion = g.unlocked_raw(|| self.storage.completion(i));
                let complete = match completion {
                    Ok(Completion::Complete) => true,
                    Ok(_) => false,
                    Err(StorageError::Closed) => {
                        g.storage_broken = true;
                        break;
                    }
                    Err(err) => {
                        warn!(piece = i, %err, "reading stored completion");
                        false
                    }
                };
                let piece = &mut g.pieces[i as usize];
                piece.storage_completion_ok = complete;
                if complete {
                    if !self.config.ignore_unverified_piece_completion {
                        g.completed.set(i as usize);
                    }
                    if !self.config.disable_initial_piece_check {
                        recheck.push(i);
                    }
                }
                self.update_piece_order(&mut g, i);
            }
        }
        if recheck.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let mut g = self.lock.write();
            for i in recheck {
                self.queue_piece_check_on(&handle, &mut g, i);
            }
        } else {
            debug!("no runtime at construction, skipping initial piece checks");
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Torrent-wide transfer counters.
    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub fn subscribe_piece_events(&self) -> broadcast::Receiver<PieceStateEvent> {
        self.state_events.subscribe()
    }

    /// Installs the client-wide hook invoked when a chunk write fails.
    pub fn set_on_write_chunk_err(&self, hook: impl Fn(&StorageError) + Send + Sync + 'static) {
        *self.on_write_chunk_err.lock() = Some(Box::new(hook));
    }

    fn publish(&self, piece: PieceIndex, state: PieceState) {
        let _ = self.state_events.send(PieceStateEvent { piece, state });
    }

    // ------------------------------------------------------------------
    // Peer registration
    // ------------------------------------------------------------------

    /// Registers a peer. The link is built once the peer id is known so the
    /// transport can carry it.
    pub fn add_peer(
        &self,
        make_link: impl FnOnce(PeerId) -> Arc<dyn PeerLink>,
    ) -> (PeerId, Arc<ConnStats>) {
        let mut g = self.lock.write();
        let peer = PeerId(g.next_peer_id);
        g.next_peer_id += 1;
        let stats = Arc::new(ConnStats::default());
        let record = PeerRecord {
            state: PeerRequestState::new(self.layout.piece_count() as usize),
            link: make_link(peer),
            stats: stats.clone(),
            last_unhandled_err: None,
        };
        g.peers.insert(peer, record);
        (peer, stats)
    }

    /// Drops a peer: cancels all its requests, decrements availability, and
    /// re-triggers scheduling on peers that ran dry.
    pub fn close_peer(&self, peer: PeerId) {
        let mut g = self.lock.write();
        if !g.peers.contains_key(&peer) {
            return;
        }
        self.delete_all_requests(&mut g, peer, UpdateReason::PeerClosed);
        // Cancelled-and-unacked entries die with the record.
        let had: Vec<PieceIndex> = {
            let rec = g.peers.get(&peer).unwrap();
            if rec.state.pieces.has_all() {
                (0..self.layout.piece_count()).collect()
            } else {
                rec.state.pieces.bits().iter().map(|i| i as u32).collect()
            }
        };
        let mut reshaped = false;
        for i in had {
            let piece = &mut g.pieces[i as usize];
            piece.availability = piece.availability.saturating_sub(1);
            reshaped |= self.update_piece_order(&mut g, i);
        }
        if reshaped {
            self.notify_order_reshape(&mut g, peer);
        }
        let rec = g.peers.remove(&peer).unwrap();
        rec.link.on_close();
        drop(g);
        self.event.broadcast();
    }

    /// Closes the torrent: drops every peer and stops future scheduling.
    pub fn close(&self) {
        let peers: Vec<PeerId> = {
            let mut g = self.lock.write();
            g.closed = true;
            g.peers.keys().copied().collect()
        };
        for peer in peers {
            self.close_peer(peer);
        }
        self.event.broadcast();
    }

    // ------------------------------------------------------------------
    // Scheduler triggers from outside (§ external interface)
    // ------------------------------------------------------------------

    /// Changes a piece's priority. Returns true if it changed.
    pub fn set_piece_priority(&self, piece: PieceIndex, priority: Priority) -> bool {
        let mut g = self.lock.write();
        if g.pieces[piece as usize].priority == priority {
            return false;
        }
        g.pieces[piece as usize].priority = priority;
        self.update_piece_order(&mut g, piece);
        let peers: Vec<PeerId> = g.peers.keys().copied().collect();
        for p in peers {
            let serves = g
                .peer(p)
                .is_some_and(|rec| rec.state.pieces.has(piece));
            if serves || priority == Priority::None {
                scheduler::update_requests_deferred(&mut g, p, UpdateReason::PriorityChange);
            }
        }
        true
    }

    pub fn on_have(&self, peer: PeerId, piece: PieceIndex) -> Result<(), PeerError> {
        if piece >= self.layout.piece_count() {
            return Err(PeerError::Protocol(format!("have for piece {piece}")));
        }
        let mut g = self.lock.write();
        let fresh = {
            let Some(rec) = g.peer_mut(peer) else {
                return Ok(());
            };
            let fresh = !rec.state.pieces.has(piece);
            rec.state.pieces.set(piece);
            fresh
        };
        if fresh {
            g.pieces[piece as usize].availability += 1;
            let reshaped = self.update_piece_order(&mut g, piece);
            if g.pending_pieces.contains(piece) {
                scheduler::update_requests_deferred(&mut g, peer, UpdateReason::Have);
            }
            if reshaped {
                self.notify_order_reshape(&mut g, peer);
            }
        }
        Ok(())
    }

    pub fn on_bitfield(&self, peer: PeerId, bits: Bitfield) {
        let mut g = self.lock.write();
        let added: Vec<PieceIndex> = {
            let Some(rec) = g.peer_mut(peer) else {
                return;
            };
            let added = bits
                .iter()
                .map(|i| i as u32)
                .filter(|&i| !rec.state.pieces.has(i))
                .collect();
            rec.state.pieces.set_bitfield(bits);
            added
        };
        let mut reshaped = false;
        for i in added {
            g.pieces[i as usize].availability += 1;
            reshaped |= self.update_piece_order(&mut g, i);
        }
        scheduler::update_requests_deferred(&mut g, peer, UpdateReason::Bitfield);
        if reshaped {
            self.notify_order_reshape(&mut g, peer);
        }
    }

    pub fn on_have_all(&self, peer: PeerId) {
        let mut g = self.lock.write();
        let added: Vec<PieceIndex> = {
            let Some(rec) = g.peer_mut(peer) else {
                return;
            };
            let added = (0..self.layout.piece_count())
                .filter(|&i| !rec.state.pieces.has(i))
                .collect();
            rec.state.pieces.set_have_all();
            added
        };
        let mut reshaped = false;
        for i in added {
            g.pieces[i as usize].availability += 1;
            reshaped |= self.update_piece_order(&mut g, i);
        }
        scheduler::update_requests_deferred(&mut g, peer, UpdateReason::Bitfield);
        if reshaped {
            self.notify_order_reshape(&mut g, peer);
        }
    }

    pub fn on_have_none(&self, peer: PeerId) {
        let mut g = self.lock.write();
        if let Some(rec) = g.peer_mut(peer) {
            rec.state.pieces.set_have_none();
        }
    }

    pub fn on_allowed_fast(&self, peer: PeerId, piece: PieceIndex) -> Result<(), PeerError> {
        if piece >= self.layout.piece_count() {
            return Err(PeerError::Protocol(format!("allowed fast for {piece}")));
        }
        let mut g = self.lock.write();
        let relevant = {
            let Some(rec) = g.peer_mut(peer) else {
                return Ok(());
            };
            rec.state.allowed_fast.insert(piece);
            rec.state.peer_choking && rec.state.pieces.has(piece)
        };
        if relevant && g.pending_pieces.contains(piece) {
            scheduler::update_requests_deferred(&mut g, peer, UpdateReason::AllowedFast);
        }
        Ok(())
    }

    /// Handles a choke or unchoke from the peer. On choke, outstanding
    /// requests for pieces outside the allowed-fast set move to `cancelled`
    /// to await explicit rejects, and their ownership entries are freed for
    /// other peers.
    pub fn on_peer_choke(&self, peer: PeerId, choking: bool) {
        let mut g = self.lock.write();
        {
            let Some(rec) = g.peer_mut(peer) else {
                return;
            };
            if rec.state.peer_choking == choking {
                return;
            }
            rec.state.peer_choking = choking;
            rec.state.update_expecting_chunks();
        }
        if !choking {
            scheduler::update_requests_deferred(&mut g, peer, UpdateReason::PeerUnchoked);
            return;
        }
        let snapshot: Vec<RequestIndex> = g
            .peer(peer)
            .map(|rec| rec.state.requests.iter_snapshot().collect())
            .unwrap_or_default();
        for r in snapshot {
            let piece = self.layout.piece_of(r);
            if g.peer(peer).is_some_and(|rec| rec.state.allowed_fast.contains(&piece)) {
                continue;
            }
            scheduler::delete_peer_request(&mut g, peer, r);
            if let Some(rec) = g.peer_mut(peer) {
                rec.state.cancelled.insert(r);
                rec.state.dec_peak_requests();
            }
        }
        scheduler::update_requests_deferred(&mut g, peer, UpdateReason::PeerChoked);
        // The freed chunks can be picked up by peers that had run dry.
        let others: Vec<PeerId> = g.peers.keys().copied().filter(|&p| p != peer).collect();
        for p in others {
            if g.peer(p).is_some_and(|rec| rec.state.is_low_on_requests()) {
                scheduler::update_requests_deferred(&mut g, p, UpdateReason::PeerChoked);
            }
        }
    }

    pub fn on_peer_interested(&self, peer: PeerId, interested: bool) {
        let mut g = self.lock.write();
        if let Some(rec) = g.peer_mut(peer) {
            rec.state.peer_interested = interested;
        }
    }

    pub fn set_peer_max_requests(&self, peer: PeerId, max: u32) {
        let mut g = self.lock.write();
        if let Some(rec) = g.peer_mut(peer) {
            rec.state.peer_max_requests = max.max(1);
        }
    }

    pub fn set_peer_trusted(&self, peer: PeerId, trusted: bool) {
        let mut g = self.lock.write();
        if let Some(rec) = g.peer_mut(peer) {
            rec.state.trusted = trusted;
        }
    }

    // ------------------------------------------------------------------
    // Request settlement
    // ------------------------------------------------------------------

    /// Handles a Reject (or a webseed fetch failure standing in for one).
    /// Returns `InvalidReject` when the request was neither outstanding nor
    /// awaiting a cancel ack; callers close the peer on that.
    pub fn remote_rejected(&self, peer: PeerId, req: &Request) -> Result<(), PeerError> {
        if !self.layout.valid_request(req) {
            return Err(PeerError::InvalidReject(*req));
        }
        let r = self.layout.request_index(req);
        let mut g = self.lock.write();
        if scheduler::delete_peer_request(&mut g, peer, r) {
            if let Some(rec) = g.peer_mut(peer) {
                rec.state.dec_peak_requests();
            }
        } else {
            let in_cancelled = g
                .peer_mut(peer)
                .is_some_and(|rec| rec.state.cancelled.remove(r));
            if !in_cancelled {
                return Err(PeerError::InvalidReject(*req));
            }
        }
        let low = {
            let Some(rec) = g.peer_mut(peer) else {
                return Ok(());
            };
            rec.state.dec_receive_credit(r);
            rec.state.is_low_on_requests()
        };
        if low {
            scheduler::update_requests_deferred(&mut g, peer, UpdateReason::RemoteReject);
        }
        Ok(())
    }

    /// Records a peer-side unhandled error for status polling.
    pub fn note_unhandled_peer_err(&self, peer: PeerId) {
        let mut g = self.lock.write();
        if let Some(rec) = g.peer_mut(peer) {
            rec.last_unhandled_err = Some(Instant::now());
        }
    }

    // ------------------------------------------------------------------
    // Chunk receive pipeline
    // ------------------------------------------------------------------

    /// Routes one received chunk: validate, settle the request, write to
    /// storage off-lock, account stats, queue verification when the piece
    /// fills, and wake waiters.
    pub fn receive_chunk(
        self: &Arc<Self>,
        peer: PeerId,
        piece: PieceIndex,
        begin: u32,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let req = Request::new(piece, begin, data.len() as u32);
        if !self.layout.valid_request(&req) {
            return Err(PeerError::ChunkOverflowsPiece(req));
        }
        let r = self.layout.request_index(&req);
        // A short payload would leave the chunk marked dirty without its
        // tail ever being written.
        if self.layout.chunk_spec(r).length != req.length {
            return Err(PeerError::ChunkOverflowsPiece(req));
        }

        let mut g = self.lock.write();
        if g.closed {
            return Ok(());
        }

        let intended = {
            let Some(rec) = g.peer_mut(peer) else {
                return Err(PeerError::ConnectionClosed);
            };
            rec.stats.received_chunk(data.len() as u64);
            self.stats.received_chunk(data.len() as u64);
            if !rec.state.dec_receive_credit(r) {
                rec.stats.chunks_read_unexpected.inc();
                self.stats.chunks_read_unexpected.inc();
                return Err(PeerError::UnexpectedChunk(req));
            }
            rec.state.cancelled.remove(r)
        };
        // Settle our own outstanding request before the off-lock write so a
        // concurrent scheduler pass cannot cancel a request we already hold
        // the data for.
        let intended = scheduler::delete_peer_request(&mut g, peer, r) || intended;
        if intended {
            let low = g
                .peer(peer)
                .is_some_and(|rec| rec.state.is_low_on_requests());
            if low {
                scheduler::update_requests_deferred(&mut g, peer, UpdateReason::ReceivedChunk);
            }
        }

        // Do we still want this chunk?
        if g.completed.has(piece as usize) || g.dirty_chunks.contains(r) {
            let rec = g.peer_mut(peer).unwrap();
            rec.stats.chunks_read_wasted.inc();
            self.stats.chunks_read_wasted.inc();
            return Ok(());
        }

        {
            let rec = g.peer_mut(peer).unwrap();
            rec.stats.chunks_read_useful.inc();
            rec.stats.bytes_read_useful.add(data.len() as u64);
            self.stats.chunks_read_useful.inc();
            self.stats.bytes_read_useful.add(data.len() as u64);
            if intended {
                rec.stats.bytes_read_useful_intended.add(data.len() as u64);
                self.stats.bytes_read_useful_intended.add(data.len() as u64);
            }
        }

        // Record the chunk before anything can re-request it.
        g.pieces[piece as usize].pending_writes += 1;
        g.dirty_chunks.insert(r);
        self.update_piece_order(&mut g, piece);

        // Single-writer discipline: any other peer still carrying a live
        // request for this chunk gets it cancelled.
        if let Some(owner) = g.request_state.get(&r).map(|o| o.peer) {
            assert_ne!(
                owner, peer,
                "request still owned by the peer that just satisfied it"
            );
            scheduler::cancel_peer_request(&self.layout, &mut g, owner, r);
        }

        let write_res = g.unlocked_raw(|| self.storage.write_chunk(piece, begin, &data));
        g.pieces[piece as usize].pending_writes -= 1;

        if let Err(err) = write_res {
            warn!(piece, begin, %err, "writing received chunk");
            self.pend_request(&mut g, r);
            if matches!(err, StorageError::Closed) {
                g.storage_broken = true;
            }
            // A request update may have run while the failing write was in
            // flight; force a fresh one so the re-pended chunk is picked up.
            let peers: Vec<PeerId> = g.peers.keys().copied().collect();
            for p in peers {
                scheduler::update_requests_deferred(&mut g, p, UpdateReason::WriteError);
            }
            if let Some(hook) = &*self.on_write_chunk_err.lock() {
                hook(&err);
            }
            drop(g);
            self.event.broadcast();
            return Ok(());
        }

        {
            let rec = g.peer_mut(peer).unwrap();
            rec.stats.chunks_written.inc();
            self.stats.chunks_written.inc();
            rec.state.touched_pieces.insert(piece);
        }
        g.pieces[piece as usize].dirtiers.insert(peer);

        // Only the writer that completes the piece queues the check.
        if self.piece_all_dirty(&g, piece) && g.pieces[piece as usize].pending_writes == 0 {
            self.queue_piece_check(&mut g, piece);
        } else {
            self.publish(piece, PieceState::Partial);
        }

        drop(g);
        self.event.broadcast();
        Ok(())
    }

    /// Makes a chunk requestable again (failed write, failed hash).
    pub(crate) fn pend_request(&self, g: &mut WriteGuard<'_, TorrentState>, r: RequestIndex) {
        g.dirty_chunks.remove(r);
        self.update_piece_order(g, self.layout.piece_of(r));
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    fn queue_piece_check(self: &Arc<Self>, g: &mut WriteGuard<'_, TorrentState>, piece: PieceIndex) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => self.queue_piece_check_on(&handle, g, piece),
            Err(_) => warn!(piece, "no runtime to run piece check on"),
        }
    }

    fn queue_piece_check_on(
        self: &Arc<Self>,
        handle: &tokio::runtime::Handle,
        g: &mut WriteGuard<'_, TorrentState>,
        piece: PieceIndex,
    ) {
        let p = &mut g.pieces[piece as usize];
        if p.checking() {
            return;
        }
        p.queued_for_hash = true;
        self.update_piece_order(g, piece);
        self.publish(piece, PieceState::QueuedForCheck);
        let this = self.clone();
        handle.spawn(async move { this.verify_piece(piece).await });
    }

    async fn verify_piece(self: Arc<Self>, piece: PieceIndex) {
        {
            let mut g = self.lock.write();
            let p = &mut g.pieces[piece as usize];
            if !p.queued_for_hash {
                return;
            }
            p.queued_for_hash = false;
            p.hashing = true;
        }
        self.publish(piece, PieceState::Checking);

        let storage = self.storage.clone();
        let verifier = self.verifier.clone();
        let length = self.layout.piece_length_of(piece);
        let result = tokio::task::spawn_blocking(move || {
            let mut reader = PieceReader::new(storage.as_ref(), piece, length);
            verifier.hash_piece(piece, &mut reader)
        })
        .await
        .unwrap_or_else(|join_err| Err(std::io::Error::other(join_err.to_string())));

        let mut g = self.lock.write();
        {
            let p = &mut g.pieces[piece as usize];
            p.hashing = false;
            p.num_verifies += 1;
        }
        let expected = g.pieces[piece as usize].expected_hash;
        match result {
            Ok(hash) if hash == expected => self.on_piece_verified(&mut g, piece),
            Ok(_) => {
                debug!(piece, "piece hash mismatch");
                self.on_piece_bad(&mut g, piece);
            }
            Err(err) => {
                warn!(piece, %err, "reading piece for verification");
                self.on_piece_bad_no_blame(&mut g, piece);
            }
        }
        drop(g);
        self.event.broadcast();
    }

    fn on_piece_verified(self: &Arc<Self>, g: &mut WriteGuard<'_, TorrentState>, piece: PieceIndex) {
        g.pieces[piece as usize].marking = true;
        let mark_res = g.unlocked_raw(|| {
            self.storage.mark_complete(piece).and_then(|()| {
                if self.storage.is_durable() {
                    self.storage.flush()
                } else {
                    Ok(())
                }
            })
        });
        g.pieces[piece as usize].marking = false;
        if let Err(err) = mark_res {
            warn!(piece, %err, "marking piece complete");
            if matches!(err, StorageError::Closed) {
                g.storage_broken = true;
            }
            self.on_piece_bad_no_blame(g, piece);
            return;
        }
        g.completed.set(piece as usize);
        g.pieces[piece as usize].storage_completion_ok = true;
        let dirtiers = std::mem::take(&mut g.pieces[piece as usize].dirtiers);
        for p in &dirtiers {
            if let Some(rec) = g.peer(*p) {
                rec.stats.pieces_dirtied_good.inc();
            }
        }
        self.stats.pieces_dirtied_good.inc();
        self.update_piece_order(g, piece);

        let peers: Vec<PeerId> = g.peers.keys().copied().collect();
        for p in peers {
            if let Some(rec) = g.peer(p) {
                rec.link.send_have(piece);
            }
            scheduler::update_requests_deferred(g, p, UpdateReason::PieceCompleted);
        }
        self.publish(piece, PieceState::Complete);
    }

    /// Hash failure with dirtier blame: the peers whose chunks built the
    /// piece get a bad mark, and the piece re-enters the pending set.
    fn on_piece_bad(self: &Arc<Self>, g: &mut WriteGuard<'_, TorrentState>, piece: PieceIndex) {
        let dirtiers = std::mem::take(&mut g.pieces[piece as usize].dirtiers);
        for p in &dirtiers {
            if let Some(rec) = g.peer(*p) {
                rec.stats.pieces_dirtied_bad.inc();
            }
        }
        self.stats.pieces_dirtied_bad.inc();
        self.repend_piece(g, piece);
    }

    /// Hash could not run (storage read error); no peer is blamed.
    fn on_piece_bad_no_blame(
        self: &Arc<Self>,
        g: &mut WriteGuard<'_, TorrentState>,
        piece: PieceIndex,
    ) {
        g.pieces[piece as usize].dirtiers.clear();
        self.repend_piece(g, piece);
    }

    fn repend_piece(self: &Arc<Self>, g: &mut WriteGuard<'_, TorrentState>, piece: PieceIndex) {
        let start = self.layout.request_index_offset(piece);
        let end = self.layout.request_index_end(piece);
        for r in start..end {
            g.dirty_chunks.remove(r);
        }
        g.pieces[piece as usize].storage_completion_ok = false;
        let mark = g.unlocked_raw(|| self.storage.mark_incomplete(piece));
        if let Err(err) = mark {
            warn!(piece, %err, "marking piece incomplete");
        }
        self.update_piece_order(g, piece);
        self.publish(piece, PieceState::Bad);
        let peers: Vec<PeerId> = g.peers.keys().copied().collect();
        for p in peers {
            if g.peer(p).is_some_and(|rec| rec.state.pieces.has(piece)) {
                scheduler::update_requests_deferred(g, p, UpdateReason::HashCompleted);
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending set and request order maintenance
    // ------------------------------------------------------------------

    fn order_key(&self, piece: PieceIndex) -> OrderKey {
        OrderKey { torrent: 0, piece }
    }

    /// True when the piece should be requested at all.
    pub(crate) fn piece_requestable(&self, state: &TorrentState, piece: PieceIndex) -> bool {
        let p = &state.pieces[piece as usize];
        p.priority != Priority::None && !state.completed.has(piece as usize) && !p.checking()
    }

    pub(crate) fn piece_dirty_count(&self, state: &TorrentState, piece: PieceIndex) -> u64 {
        state.dirty_chunks.range_cardinality(
            self.layout.request_index_offset(piece),
            self.layout.request_index_end(piece),
        )
    }

    pub(crate) fn piece_all_dirty(&self, state: &TorrentState, piece: PieceIndex) -> bool {
        self.piece_dirty_count(state, piece) == self.layout.chunks_in(piece) as u64
    }

    pub(crate) fn piece_partial(&self, state: &TorrentState, piece: PieceIndex) -> bool {
        let dirty = self.piece_dirty_count(state, piece);
        dirty != 0 && dirty != self.layout.chunks_in(piece) as u64
    }

    /// Syncs one piece's entry in the pending set and the request order with
    /// its current state. Every state transition that can change either
    /// funnels through here.
    pub(crate) fn update_piece_order(&self, state: &mut TorrentState, piece: PieceIndex) -> bool {
        let requestable = self.piece_requestable(state, piece);
        let key = self.order_key(piece);
        if requestable {
            state.pending_pieces.insert(piece);
            let order_state = OrderState {
                priority: state.pieces[piece as usize].priority,
                partial: self.piece_partial(state, piece),
                availability: state.pieces[piece as usize].availability,
            };
            state.order.add(key, order_state) != Some(order_state)
        } else {
            state.pending_pieces.remove(piece);
            state.order.delete(key)
        }
    }

    /// An availability change reshuffled the request order, so a better
    /// chunk may now be available to peers whose pipelines still have room.
    /// They are not low on requests, so no other trigger would reach them
    /// before their coalescing timer fires.
    fn notify_order_reshape(&self, g: &mut WriteGuard<'_, TorrentState>, reporter: PeerId) {
        let peers: Vec<PeerId> = g.peers.keys().copied().collect();
        for p in peers {
            if p == reporter {
                continue;
            }
            let has_room = g.peer(p).is_some_and(|rec| {
                (rec.state.requests.cardinality() as u32) < rec.state.nominal_max_requests()
            });
            if has_room {
                scheduler::update_requests_deferred(g, p, UpdateReason::OrderReshape);
            }
        }
    }

    fn delete_all_requests(
        &self,
        g: &mut WriteGuard<'_, TorrentState>,
        peer: PeerId,
        reason: UpdateReason,
    ) {
        let snapshot: Vec<RequestIndex> = g
            .peer(peer)
            .map(|rec| rec.state.requests.iter_snapshot().collect())
            .unwrap_or_default();
        for r in snapshot {
            assert!(
                scheduler::delete_peer_request(g, peer, r),
                "request should exist"
            );
        }
        debug_assert!(g
            .peer(peer)
            .is_none_or(|rec| rec.state.requests.is_empty()));
        let others: Vec<PeerId> = g.peers.keys().copied().filter(|&p| p != peer).collect();
        for p in others {
            if g.peer(p).is_some_and(|rec| rec.state.is_low_on_requests()) {
                scheduler::update_requests_deferred(g, p, reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduler entry points
    // ------------------------------------------------------------------

    /// Runs the scheduler for a peer if a trigger is pending. Called by the
    /// writer's fill callback and by webseed requester wakeups.
    pub fn fill_requests(&self, peer: PeerId) {
        let mut g = self.lock.write();
        self.maybe_update_requests(&mut g, peer);
    }

    pub(crate) fn maybe_update_requests(
        &self,
        g: &mut WriteGuard<'_, TorrentState>,
        peer: PeerId,
    ) {
        let pending = g
            .peer(peer)
            .and_then(|rec| rec.state.need_request_update);
        if pending.is_none() {
            return;
        }
        if g.closed || g.storage_broken {
            if let Some(rec) = g.peer_mut(peer) {
                rec.state.need_request_update = None;
            }
            return;
        }
        let desired = scheduler::compute_desired(&self.layout, &self.config, g, peer);
        scheduler::apply_desired(&self.layout, g, peer, &desired);
    }

    /// External trigger, e.g. from the per-peer coalescing timer.
    pub fn trigger_update(&self, peer: PeerId, reason: UpdateReason) {
        let mut g = self.lock.write();
        scheduler::update_requests_deferred(&mut g, peer, reason);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot of verified pieces.
    pub fn completed_pieces(&self) -> Bitfield {
        self.lock.read().completed.clone()
    }

    pub fn is_complete(&self) -> bool {
        let g = self.lock.read();
        g.completed.is_full()
    }

    pub fn num_verifies(&self, piece: PieceIndex) -> u64 {
        self.lock.read().pieces[piece as usize].num_verifies
    }

    pub fn piece_availability(&self, piece: PieceIndex) -> u32 {
        self.lock.read().pieces[piece as usize].availability
    }

    /// Whether the peer would be useful to keep alive: we want pieces from
    /// them, or they want pieces from us.
    pub fn peer_useful(&self, peer: PeerId) -> bool {
        let g = self.lock.read();
        let Some(rec) = g.peer(peer) else {
            return false;
        };
        if rec.state.peer_interested {
            return true;
        }
        if !g.pending_pieces.is_empty() {
            return g
                .pending_pieces
                .iter()
                .any(|i| rec.state.pieces.has(i));
        }
        false
    }

    /// Age of the peer's last unhandled error, for client polling.
    pub fn peer_last_unhandled_err(&self, peer: PeerId) -> Option<std::time::Duration> {
        self.lock
            .read()
            .peer(peer)
            .and_then(|rec| rec.last_unhandled_err)
            .map(|t| t.elapsed())
    }

    /// Human-readable status lines for one peer.
    pub fn peer_status(&self, peer: PeerId) -> Vec<String> {
        let g = self.lock.read();
        let Some(rec) = g.peer(peer) else {
            return vec!["closed".into()];
        };
        let mut lines = Vec::new();
        lines.push(format!(
            "{}: {}/{} pieces, reqq {}+{}/{}, good chunks {}/{}",
            rec.link.flags(),
            rec.state.pieces.count(self.layout.piece_count() as usize),
            self.layout.piece_count(),
            rec.state.requests.cardinality(),
            rec.state.cancelled.cardinality(),
            rec.state.nominal_max_requests(),
            rec.stats.chunks_read_useful.get(),
            rec.stats.chunks_read.get(),
        ));
        lines.push(format!(
            "last unhandled error: {}",
            match rec.last_unhandled_err {
                None => "never".to_owned(),
                Some(t) => format!("{:.2}s ago", t.elapsed().as_secs_f64()),
            }
        ));
        let mut groups = String::from("requested pieces:");
        let mut last: Option<(PieceIndex, u32)> = None;
        for r in rec.state.requests.iter() {
            let piece = self.layout.piece_of(r);
            match &mut last {
                Some((p, n)) if *p == piece => *n += 1,
                _ => {
                    if let Some((p, n)) = last.take() {
                        groups.push_str(&format!(" {p}({n})"));
                    }
                    last = Some((piece, 1));
                }
            }
        }
        if let Some((p, n)) = last {
            groups.push_str(&format!(" {p}({n})"));
        }
        lines.push(groups);
        lines
    }

    /// Blocks until a piece verifies complete or the torrent closes.
    pub async fn wait_piece_complete(&self, piece: PieceIndex) {
        let mut g = self.lock.write();
        loop {
            if g.completed.has(piece as usize) || g.closed {
                return;
            }
            g = self.event.wait(g).await;
        }
    }

    /// Asserts the cross-structure invariants. Test and debug aid.
    pub fn check_invariants(&self) {
        let g = self.lock.read();
        for (&r, owner) in &g.request_state {
            let holders = g
                .peers
                .values()
                .filter(|rec| rec.state.requests.contains(r))
                .count();
            assert!(
                holders >= 1,
                "request {r} owned by {:?} but no peer holds it",
                owner.peer
            );
            assert!(
                g.peer(owner.peer)
                    .is_some_and(|rec| rec.state.requests.contains(r)),
                "request {r} owner does not hold it"
            );
        }
        for (id, rec) in &g.peers {
            for r in rec.state.requests.iter() {
                assert!(
                    !rec.state.cancelled.contains(r),
                    "peer {id:?} has {r} both outstanding and cancelled"
                );
            }
        }
        for i in 0..self.layout.piece_count() {
            let requestable = self.piece_requestable(&g, i);
            assert_eq!(
                requestable,
                g.order.contains(self.order_key(i)),
                "piece {i} pending/order mismatch"
            );
            assert_eq!(requestable, g.pending_pieces.contains(i));
        }
    }

    // Used by the end-to-end tests to reach the owner map.
    #[cfg(test)]
    pub(crate) fn requesting_peer(&self, r: RequestIndex) -> Option<PeerId> {
        self.lock.read().requesting_peer(r)
    }

    #[cfg(test)]
    pub(crate) fn peer_requests(&self, peer: PeerId) -> Vec<RequestIndex> {
        self.lock
            .read()
            .peer(peer)
            .map(|rec| rec.state.requests.iter().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn peer_cancelled(&self, peer: PeerId) -> Vec<RequestIndex> {
        self.lock
            .read()
            .peer(peer)
            .map(|rec| rec.state.cancelled.iter().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn pending_pieces_snapshot(&self) -> Vec<PieceIndex> {
        self.lock.read().pending_pieces.iter().collect()
    }

    #[cfg(test)]
    pub(crate) fn pending_writes(&self, piece: PieceIndex) -> u32 {
        self.lock.read().pieces[piece as usize].pending_writes
    }
}

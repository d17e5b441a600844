//! Request scheduling.
//!
//! `compute_desired` walks the piece request order and produces the target
//! outstanding set for one peer; `apply_desired` diffs it against the
//! current set, cancelling requests that fell out and issuing the new ones
//! in request-index order. The mutation helpers here are also used by the
//! receive pipeline and the session transitions, so the one-writer-per-
//! request discipline lives in a single place.

use std::time::Instant;

use crate::bitmap::RequestBitmap;
use crate::constants::REQUEST_STALE;
use crate::layout::{Layout, RequestIndex};
use crate::peer::state::{PeerId, RequestError, UpdateReason};
use crate::sync::{DeferKey, WriteGuard};
use crate::torrent::config::Config;
use crate::torrent::state::{RequestOwner, TorrentState};

/// The target request set for one peer, as computed from the piece request
/// order. `apply_desired` makes it real.
#[derive(Debug, Default, Clone)]
pub struct DesiredState {
    pub requests: Vec<RequestIndex>,
    pub interested: bool,
}

/// Sets a trigger reason (first one wins) and schedules a single wake of
/// the peer's drainer for this lock cycle.
pub(crate) fn update_requests_deferred(
    g: &mut WriteGuard<'_, TorrentState>,
    peer: PeerId,
    reason: UpdateReason,
) {
    {
        let Some(rec) = g.peer_mut(peer) else {
            return;
        };
        if rec.state.need_request_update.is_some() {
            return;
        }
        rec.state.need_request_update = Some(reason);
    }
    g.defer_unique(
        DeferKey {
            func: "wake_for_request_update",
            arg: peer.0,
        },
        move |state: &mut TorrentState| {
            if let Some(rec) = state.peers.get(&peer) {
                rec.link.wake();
            }
        },
    );
}

/// Raw-lock variant: wakes the peer's drainer immediately instead of
/// deferring. Paths that cannot defer must use this before releasing the
/// lock, or the trigger would sit unobserved.
pub(crate) fn update_requests_direct(state: &mut TorrentState, peer: PeerId, reason: UpdateReason) {
    let Some(rec) = state.peers.get_mut(&peer) else {
        return;
    };
    if rec.state.need_request_update.is_some() {
        return;
    }
    rec.state.need_request_update = Some(reason);
    rec.link.wake();
}

/// Removes an outstanding request from a peer and, when the peer owns it,
/// frees the ownership entry. Returns false if the peer did not hold it.
///
/// Endgame duplicates hold a request without owning it; their removal
/// leaves the owner's entry alone.
pub(crate) fn delete_peer_request(state: &mut TorrentState, peer: PeerId, r: RequestIndex) -> bool {
    {
        let Some(rec) = state.peers.get_mut(&peer) else {
            return false;
        };
        if !rec.state.requests.remove(r) {
            return false;
        }
        rec.state.update_expecting_chunks();
    }
    if state.request_state.get(&r).map(|o| o.peer) == Some(peer) {
        state.request_state.remove(&r);
    }
    true
}

/// Cancels an outstanding request: removes it, sends a Cancel through the
/// peer's link, and parks it in `cancelled` when the transport acks cancels.
pub(crate) fn cancel_peer_request(
    layout: &Layout,
    state: &mut TorrentState,
    peer: PeerId,
    r: RequestIndex,
) {
    assert!(
        delete_peer_request(state, peer, r),
        "cancel of request the peer does not hold"
    );
    let link = match state.peers.get(&peer) {
        Some(rec) => rec.link.clone(),
        None => return,
    };
    let expects_ack = link.send_cancel(layout.request(r));
    let low = {
        let rec = state.peers.get_mut(&peer).unwrap();
        if expects_ack {
            assert!(rec.state.cancelled.insert(r), "request already cancelled");
        }
        rec.state.dec_peak_requests();
        rec.state.is_low_on_requests()
    };
    if low {
        update_requests_direct(state, peer, UpdateReason::Cancel);
    }
}

/// Checks every precondition for issuing a request to a peer. Keeping an
/// already-outstanding request is always fine.
pub(crate) fn should_request(
    layout: &Layout,
    state: &TorrentState,
    peer: PeerId,
    r: RequestIndex,
) -> Result<(), RequestError> {
    let Some(rec) = state.peers.get(&peer) else {
        return Err(RequestError::PeerLacksPiece);
    };
    let already_held = rec.state.requests.contains(r);
    let piece = layout.piece_of(r);
    if rec.state.cancelled.contains(r) {
        return Err(RequestError::AlreadyCancelled);
    }
    if !rec.state.pieces.has(piece) {
        return Err(RequestError::PeerLacksPiece);
    }
    if state.pieces[piece as usize].checking() {
        return Err(RequestError::PieceHashing);
    }
    if rec.state.peer_choking && !rec.state.allowed_fast.contains(&piece) && !already_held {
        return Err(RequestError::PeerChokingNotFast);
    }
    if state.dirty_chunks.contains(r) && !already_held {
        return Err(RequestError::ChunkAlreadyHeld);
    }
    if !already_held
        && rec.state.requests.cardinality() >= rec.state.nominal_max_requests() as u64
    {
        return Err(RequestError::TooManyOutstanding);
    }
    Ok(())
}

// Whether the current owner of a request ranks strictly worse than the
// candidate, by (trust, download rate, pending time).
fn requester_is_worse(state: &TorrentState, owner: &RequestOwner, candidate: PeerId) -> bool {
    let Some(own) = state.peers.get(&owner.peer) else {
        return true;
    };
    let Some(cand) = state.peers.get(&candidate) else {
        return false;
    };
    let own_trust = (own.state.trusted, own.stats.net_good_pieces_dirtied());
    let cand_trust = (cand.state.trusted, cand.stats.net_good_pieces_dirtied());
    if cand_trust != own_trust {
        return cand_trust > own_trust;
    }
    let own_rate = own.state.download_rate(own.stats.bytes_read_useful.get());
    let cand_rate = cand.state.download_rate(cand.stats.bytes_read_useful.get());
    if cand_rate != own_rate {
        return cand_rate > own_rate;
    }
    owner.since.elapsed() >= REQUEST_STALE
}

/// Computes the target request set for a peer by walking the piece request
/// order. Pieces the peer cannot serve, pieces in verification, and chunks
/// already held or awaiting a cancel ack are skipped; chunks owned by
/// another peer are taken only when that peer ranks worse, or duplicated in
/// endgame.
pub(crate) fn compute_desired(
    layout: &Layout,
    config: &Config,
    state: &TorrentState,
    peer: PeerId,
) -> DesiredState {
    let Some(rec) = state.peers.get(&peer) else {
        return DesiredState::default();
    };
    let max = rec.state.nominal_max_requests() as usize;
    let pending = state.pending_pieces.cardinality();
    let endgame = pending > 0 && pending <= config.endgame_pieces_threshold;

    let mut requests = Vec::new();
    'pieces: for item in state.order.iter() {
        if requests.len() >= max {
            break;
        }
        let piece = item.key.piece;
        if !rec.state.pieces.has(piece) {
            continue;
        }
        if rec.state.peer_choking && !rec.state.allowed_fast.contains(&piece) {
            continue;
        }
        let p = &state.pieces[piece as usize];
        if p.checking() || state.completed.has(piece as usize) {
            continue;
        }
        for r in layout.request_index_offset(piece)..layout.request_index_end(piece) {
            if requests.len() >= max {
                break 'pieces;
            }
            if state.dirty_chunks.contains(r) {
                continue;
            }
            if rec.state.cancelled.contains(r) {
                continue;
            }
            match state.request_state.get(&r) {
                None => requests.push(r),
                Some(owner) if owner.peer == peer => requests.push(r),
                Some(owner) => {
                    if requester_is_worse(state, owner, peer) || endgame {
                        requests.push(r);
                    }
                }
            }
        }
    }
    let interested = !requests.is_empty();
    DesiredState {
        requests,
        interested,
    }
}

/// Applies a desired state: cancels requests that fell out of the target,
/// updates interest, and issues the additions in request-index order.
/// Clears the peer's pending trigger.
pub(crate) fn apply_desired(
    layout: &Layout,
    state: &mut TorrentState,
    peer: PeerId,
    desired: &DesiredState,
) {
    if !state.peers.contains_key(&peer) {
        return;
    }
    let desired_set: RequestBitmap = desired.requests.iter().copied().collect();

    let current: Vec<RequestIndex> = state
        .peers
        .get(&peer)
        .map(|rec| rec.state.requests.iter_snapshot().collect())
        .unwrap_or_default();
    for r in current {
        if !desired_set.contains(r) {
            cancel_peer_request(layout, state, peer, r);
        }
    }

    let (interest_changed, link) = {
        let rec = state.peers.get_mut(&peer).unwrap();
        (
            rec.state.set_interested(desired.interested),
            rec.link.clone(),
        )
    };
    if interest_changed {
        link.send_interested(desired.interested);
    }

    let mut to_add = desired.requests.clone();
    to_add.sort_unstable();
    for r in to_add {
        if state.peers.get(&peer).unwrap().state.requests.contains(r) {
            continue;
        }
        match should_request(layout, state, peer, r) {
            Ok(()) => {}
            Err(RequestError::TooManyOutstanding) => break,
            Err(_) => continue,
        }
        match state.request_state.get(&r).map(|o| o.peer) {
            None => {
                state.request_state.insert(
                    r,
                    RequestOwner {
                        peer,
                        since: Instant::now(),
                    },
                );
            }
            Some(p) if p == peer => {
                panic!("request owner does not hold its request");
            }
            Some(other) => {
                let owner = *state.request_state.get(&r).unwrap();
                if requester_is_worse(state, &owner, peer) {
                    cancel_peer_request(layout, state, other, r);
                    state.request_state.insert(
                        r,
                        RequestOwner {
                            peer,
                            since: Instant::now(),
                        },
                    );
                }
                // Otherwise this is an endgame duplicate: the entry stays
                // with its owner and this peer only gains a receive credit.
            }
        }
        let rec = state.peers.get_mut(&peer).unwrap();
        rec.state.requests.insert(r);
        rec.state.inc_receive_credit(r);
        let link = rec.link.clone();
        link.send_request(layout.request(r));
    }

    let rec = state.peers.get_mut(&peer).unwrap();
    let outstanding = rec.state.requests.cardinality() as u32;
    rec.state.peak_requests = rec.state.peak_requests.max(outstanding);
    rec.state.need_request_update = None;
    rec.state.update_expecting_chunks();
}

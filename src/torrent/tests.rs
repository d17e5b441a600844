use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::layout::{Layout, PieceIndex, Request};
use crate::order::Priority;
use crate::peer::error::PeerError;
use crate::peer::state::PeerId;
use crate::scheduler;
use crate::stats::ConnStats;
use crate::storage::{ChunkStorage, Completion, MemoryStorage, StorageError};
use crate::torrent::{Config, PeerLink, PieceState, Torrent};
use crate::verify::{sha1_hash, Sha1Verifier};
use crate::webseed::{RangeFetcher, Webseed, WebseedError};

const CHUNK: u32 = 16384;

fn make_content(layout: &Layout) -> Vec<Vec<u8>> {
    (0..layout.piece_count())
        .map(|i| {
            let len = layout.piece_length_of(i) as usize;
            (0..len)
                .map(|j| ((i as usize * 31 + j * 7) % 251) as u8)
                .collect()
        })
        .collect()
}

fn make_torrent_with(
    layout: Layout,
    config: Config,
) -> (Arc<Torrent>, Arc<MemoryStorage>, Vec<Vec<u8>>) {
    let content = make_content(&layout);
    let hashes = content.iter().map(|p| sha1_hash(p)).collect();
    let lengths: Vec<u32> = (0..layout.piece_count())
        .map(|i| layout.piece_length_of(i))
        .collect();
    let storage = Arc::new(MemoryStorage::new(&lengths));
    let torrent = Torrent::new(
        layout,
        hashes,
        storage.clone(),
        Arc::new(Sha1Verifier),
        config,
    );
    (torrent, storage, content)
}

fn make_torrent(layout: Layout) -> (Arc<Torrent>, Arc<MemoryStorage>, Vec<Vec<u8>>) {
    make_torrent_with(layout, Config::default())
}

fn no_endgame() -> Config {
    Config {
        endgame_pieces_threshold: 0,
        ..Config::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Interested(bool),
    Request(Request),
    Cancel(Request),
    Have(PieceIndex),
}

#[derive(Default)]
struct TestLink {
    sent: Mutex<Vec<Sent>>,
    wakes: AtomicUsize,
}

impl TestLink {
    fn take_requests(&self) -> Vec<Request> {
        let mut sent = self.sent.lock();
        let mut requests = Vec::new();
        sent.retain(|s| match s {
            Sent::Request(r) => {
                requests.push(*r);
                false
            }
            _ => true,
        });
        requests
    }

    fn take_cancels(&self) -> Vec<Request> {
        let mut sent = self.sent.lock();
        let mut cancels = Vec::new();
        sent.retain(|s| match s {
            Sent::Cancel(r) => {
                cancels.push(*r);
                false
            }
            _ => true,
        });
        cancels
    }
}

impl PeerLink for TestLink {
    fn send_interested(&self, interested: bool) {
        self.sent.lock().push(Sent::Interested(interested));
    }

    fn send_request(&self, r: Request) {
        self.sent.lock().push(Sent::Request(r));
    }

    fn send_cancel(&self, r: Request) -> bool {
        self.sent.lock().push(Sent::Cancel(r));
        true
    }

    fn send_have(&self, piece: PieceIndex) {
        self.sent.lock().push(Sent::Have(piece));
    }

    fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self) {}

    fn flags(&self) -> &'static str {
        "test"
    }
}

fn add_test_peer(torrent: &Arc<Torrent>) -> (PeerId, Arc<TestLink>, Arc<ConnStats>) {
    let link = Arc::new(TestLink::default());
    let link2 = link.clone();
    let (peer, stats) = torrent.add_peer(move |_| {
        let l: Arc<dyn PeerLink> = link2;
        l
    });
    (peer, link, stats)
}

fn serve(torrent: &Arc<Torrent>, peer: PeerId, content: &[Vec<u8>], req: &Request) {
    let piece = &content[req.piece as usize];
    let data =
        Bytes::copy_from_slice(&piece[req.begin as usize..(req.begin + req.length) as usize]);
    torrent.receive_chunk(peer, req.piece, req.begin, data).unwrap();
}

async fn wait_piece(torrent: &Arc<Torrent>, piece: PieceIndex) {
    tokio::time::timeout(Duration::from_secs(5), torrent.wait_piece_complete(piece))
        .await
        .expect("piece did not complete in time");
}

async fn wait_all_complete(torrent: &Arc<Torrent>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !torrent.is_complete() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("torrent did not complete in time");
}

// Scenario: single-peer linear download of four one-chunk pieces.
#[tokio::test]
async fn test_single_peer_linear_download() {
    let (torrent, storage, content) = make_torrent(Layout::new(4 * 16384, CHUNK, CHUNK));
    let mut events = torrent.subscribe_piece_events();
    let (peer, link, _stats) = add_test_peer(&torrent);
    torrent.on_have_all(peer);
    torrent.on_peer_choke(peer, false);

    let mut safety = 0;
    while !torrent.is_complete() {
        safety += 1;
        assert!(safety < 50, "download did not progress");
        torrent.fill_requests(peer);
        for req in link.take_requests() {
            serve(&torrent, peer, &content, &req);
            wait_piece(&torrent, req.piece).await;
        }
    }

    let mut completions = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if ev.state == PieceState::Complete {
            completions.push(ev.piece);
        }
    }
    assert_eq!(completions, vec![0, 1, 2, 3]);
    assert_eq!(torrent.completed_pieces().count(), 4);
    assert_eq!(torrent.stats().chunks_read_wasted.get(), 0);
    for i in 0..4 {
        assert_eq!(storage.piece_data(i), content[i as usize]);
        assert_eq!(storage.completion(i).unwrap(), Completion::Complete);
    }
    torrent.check_invariants();
}

// Scenario: two peers overlap on piece 0; the one without the request
// rejects unsolicited and gets closed, the other completes alone.
#[tokio::test]
async fn test_unsolicited_reject_is_invalid() {
    let (torrent, _storage, content) =
        make_torrent_with(Layout::new(2 * 16384, CHUNK, CHUNK), no_endgame());
    let (a, la, _) = add_test_peer(&torrent);
    torrent.on_have(a, 0).unwrap();
    torrent.on_peer_choke(a, false);
    torrent.fill_requests(a);
    assert_eq!(torrent.requesting_peer(0), Some(a));

    let (b, lb, _) = add_test_peer(&torrent);
    torrent.on_have(b, 0).unwrap();
    torrent.on_peer_choke(b, false);
    torrent.fill_requests(b);
    assert!(lb.take_requests().is_empty(), "piece 0 is already owned by a");

    let err = torrent
        .remote_rejected(b, &Request::new(0, 0, CHUNK))
        .unwrap_err();
    assert!(matches!(err, PeerError::InvalidReject(_)));
    torrent.close_peer(b);

    for req in la.take_requests() {
        serve(&torrent, a, &content, &req);
        wait_piece(&torrent, req.piece).await;
    }
    assert!(torrent.completed_pieces().has(0));
    assert_eq!(torrent.stats().chunks_read_wasted.get(), 0);
    torrent.check_invariants();
}

// Scenario: a choke with no allowed-fast moves all outstanding requests to
// `cancelled`, frees their ownership entries, and another peer picks the
// chunks up.
#[tokio::test]
async fn test_choke_moves_outstanding_to_cancelled() {
    let layout = Layout::new(2 * 8 * 16384, 8 * CHUNK, CHUNK);
    let (torrent, _storage, content) = make_torrent_with(layout, no_endgame());
    let (a, la, _) = add_test_peer(&torrent);
    torrent.on_have_all(a);
    torrent.on_peer_choke(a, false);

    // Grow the pipeline by serving full rounds until eight requests ride.
    let mut safety = 0;
    loop {
        safety += 1;
        assert!(safety < 20, "pipeline never reached eight requests");
        torrent.fill_requests(a);
        if torrent.peer_requests(a).len() >= 8 {
            break;
        }
        for req in la.take_requests() {
            serve(&torrent, a, &content, &req);
        }
    }
    la.take_requests();
    let outstanding = torrent.peer_requests(a);
    assert_eq!(outstanding.len(), 8);

    torrent.on_peer_choke(a, true);
    assert!(torrent.peer_requests(a).is_empty());
    let cancelled = torrent.peer_cancelled(a);
    assert_eq!(cancelled.len(), 8);
    for &r in &outstanding {
        assert!(cancelled.contains(&r));
        assert_eq!(torrent.requesting_peer(r), None);
    }

    let (b, lb, _) = add_test_peer(&torrent);
    torrent.on_have_all(b);
    torrent.on_peer_choke(b, false);
    torrent.fill_requests(b);
    let b_requests = lb.take_requests();
    assert!(!b_requests.is_empty(), "freed chunks must be requestable");
    for req in &b_requests {
        let r = torrent.layout().request_index(req);
        assert_eq!(torrent.requesting_peer(r), Some(b));
    }
    torrent.check_invariants();
}

struct FlakyStorage {
    inner: Arc<MemoryStorage>,
    fail_once: Mutex<HashSet<(PieceIndex, u32)>>,
}

impl ChunkStorage for FlakyStorage {
    fn read_at(&self, piece: PieceIndex, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.inner.read_at(piece, offset, buf)
    }

    fn write_chunk(&self, piece: PieceIndex, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_once.lock().remove(&(piece, offset)) {
            return Err(StorageError::Io(std::io::Error::other("injected failure")));
        }
        self.inner.write_chunk(piece, offset, data)
    }

    fn completion(&self, piece: PieceIndex) -> Result<Completion, StorageError> {
        self.inner.completion(piece)
    }

    fn mark_complete(&self, piece: PieceIndex) -> Result<(), StorageError> {
        self.inner.mark_complete(piece)
    }

    fn mark_incomplete(&self, piece: PieceIndex) -> Result<(), StorageError> {
        self.inner.mark_incomplete(piece)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.inner.flush()
    }
}

// Scenario: a write error on one chunk re-pends it; the download retries
// and still completes.
#[tokio::test]
async fn test_storage_write_error_repends_chunk() {
    let layout = Layout::new(4 * 4 * 16384, 4 * CHUNK, CHUNK);
    let content = make_content(&layout);
    let hashes = content.iter().map(|p| sha1_hash(p)).collect();
    let lengths: Vec<u32> = (0..layout.piece_count())
        .map(|i| layout.piece_length_of(i))
        .collect();
    let storage = Arc::new(FlakyStorage {
        inner: Arc::new(MemoryStorage::new(&lengths)),
        fail_once: Mutex::new(HashSet::from([(2, 3 * CHUNK)])),
    });
    let torrent = Torrent::new(
        layout,
        hashes,
        storage.clone(),
        Arc::new(Sha1Verifier),
        Config::default(),
    );
    let hook_fired = Arc::new(AtomicUsize::new(0));
    let hook_count = hook_fired.clone();
    torrent.set_on_write_chunk_err(move |_| {
        hook_count.fetch_add(1, Ordering::SeqCst);
    });

    let (peer, link, _) = add_test_peer(&torrent);
    torrent.on_have_all(peer);
    torrent.on_peer_choke(peer, false);

    let mut safety = 0;
    while !torrent.is_complete() {
        safety += 1;
        assert!(safety < 200, "download did not recover from write error");
        torrent.fill_requests(peer);
        for req in link.take_requests() {
            serve(&torrent, peer, &content, &req);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(hook_fired.load(Ordering::SeqCst), 1);
    assert_eq!(torrent.pending_writes(2), 0);
    assert_eq!(torrent.stats().chunks_read_useful.get(), 17);
    assert_eq!(torrent.stats().chunks_written.get(), 16);
    assert_eq!(storage.inner.piece_data(2), content[2]);
    torrent.check_invariants();
}

struct ScriptedFetcher {
    content: Vec<u8>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
}

impl RangeFetcher for ScriptedFetcher {
    async fn fetch(&self, start: u64, length: u64) -> Result<Bytes, WebseedError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3)).await;
        let start = start as usize;
        let end = start + length as usize;
        let data = Bytes::copy_from_slice(&self.content[start..end]);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(data)
    }
}

// Scenario: a webseed with four workers downloads 32 chunks through
// coalesced range fetches without duplicate writes.
#[tokio::test]
async fn test_webseed_downloads_all_chunks() {
    let layout = Layout::new(4 * 8 * 16384, 8 * CHUNK, CHUNK);
    let (torrent, _storage, content) = make_torrent(layout);
    let max_concurrent = Arc::new(AtomicUsize::new(0));
    let fetcher = ScriptedFetcher {
        content: content.concat(),
        concurrent: Arc::new(AtomicUsize::new(0)),
        max_concurrent: max_concurrent.clone(),
    };
    let ws = Webseed::spawn(torrent.clone(), fetcher, 4);

    wait_all_complete(&torrent).await;

    assert_eq!(torrent.stats().chunks_written.get(), 32);
    assert_eq!(torrent.stats().chunks_read_wasted.get(), 0);
    assert_eq!(torrent.stats().chunks_read_unexpected.get(), 0);
    assert!(max_concurrent.load(Ordering::SeqCst) <= 4);
    assert_eq!(ws.active_fetches(), 0);
    torrent.check_invariants();
}

struct StuckFetcher;

impl RangeFetcher for StuckFetcher {
    async fn fetch(&self, _start: u64, _length: u64) -> Result<Bytes, WebseedError> {
        std::future::pending().await
    }
}

// Scenario: closing the webseed aborts in-flight fetches and empties the
// active set.
#[tokio::test]
async fn test_webseed_close_aborts_inflight_fetches() {
    let layout = Layout::new(4 * 8 * 16384, 8 * CHUNK, CHUNK);
    let (torrent, _storage, _content) = make_torrent(layout);
    let ws = Webseed::spawn(torrent.clone(), StuckFetcher, 4);

    tokio::time::timeout(Duration::from_secs(5), async {
        while ws.active_fetches() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no fetch ever started");

    ws.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while ws.active_fetches() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("active fetches were not aborted");
}

// Scenario: a hash mismatch blames the dirtier, re-pends the piece, and the
// re-download completes.
#[tokio::test]
async fn test_hash_mismatch_blames_dirtier_and_repends() {
    let layout = Layout::new(2 * 2 * 16384, 2 * CHUNK, CHUNK);
    let (torrent, _storage, content) = make_torrent(layout);
    let (peer, link, stats) = add_test_peer(&torrent);
    torrent.on_have_all(peer);
    torrent.on_peer_choke(peer, false);

    let corrupted = Arc::new(Mutex::new(true));
    let mut safety = 0;
    while !torrent.is_complete() {
        safety += 1;
        assert!(safety < 200, "download did not recover from bad hash");
        torrent.fill_requests(peer);
        // Once the bad hash has been blamed, the re-requests get real data.
        if stats.pieces_dirtied_bad.get() > 0 {
            *corrupted.lock() = false;
        }
        for req in link.take_requests() {
            if req.piece == 1 && *corrupted.lock() {
                let mut data = content[1][req.begin as usize..(req.begin + req.length) as usize]
                    .to_vec();
                for b in &mut data {
                    *b ^= 0xFF;
                }
                torrent
                    .receive_chunk(peer, req.piece, req.begin, Bytes::from(data))
                    .unwrap();
            } else {
                serve(&torrent, peer, &content, &req);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(stats.pieces_dirtied_bad.get(), 1);
    assert_eq!(stats.pieces_dirtied_good.get(), 2);
    assert_eq!(torrent.completed_pieces().count(), 2);
    assert!(torrent.num_verifies(1) >= 2);
    torrent.check_invariants();
}

// Running the scheduler twice in a row must be a no-op: the second desired
// state equals the applied one.
#[tokio::test]
async fn test_compute_desired_is_idempotent() {
    let layout = Layout::new(2 * 8 * 16384, 8 * CHUNK, CHUNK);
    let (torrent, _storage, content) = make_torrent_with(layout, no_endgame());
    let (peer, link, _) = add_test_peer(&torrent);
    torrent.on_have_all(peer);
    torrent.on_peer_choke(peer, false);

    // Exercise a mixed trigger sequence first.
    torrent.set_piece_priority(1, Priority::High);
    torrent.fill_requests(peer);
    for req in link.take_requests() {
        serve(&torrent, peer, &content, &req);
    }
    torrent.on_allowed_fast(peer, 0).unwrap();
    torrent.fill_requests(peer);
    link.take_requests();

    let current: Vec<_> = torrent.peer_requests(peer);
    let desired = {
        let g = torrent.lock.read();
        scheduler::compute_desired(torrent.layout(), torrent.config(), &g, peer)
    };
    let mut sorted = desired.requests.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, current, "second pass must produce no adds/cancels");
    assert!(link.take_cancels().is_empty());
    torrent.check_invariants();
}

// Endgame: when few pieces remain, a second peer may duplicate a live
// request without taking over its ownership entry.
#[tokio::test]
async fn test_endgame_duplicates_requests() {
    let (torrent, _storage, content) = make_torrent(Layout::new(16384, CHUNK, CHUNK));
    let (a, la, _) = add_test_peer(&torrent);
    torrent.on_have_all(a);
    torrent.on_peer_choke(a, false);
    torrent.fill_requests(a);
    assert_eq!(la.take_requests().len(), 1);
    assert_eq!(torrent.requesting_peer(0), Some(a));

    let (b, lb, _) = add_test_peer(&torrent);
    torrent.on_have_all(b);
    torrent.on_peer_choke(b, false);
    torrent.fill_requests(b);
    let b_reqs = lb.take_requests();
    assert_eq!(b_reqs.len(), 1, "endgame duplicate expected");
    // Ownership stays with the first requester.
    assert_eq!(torrent.requesting_peer(0), Some(a));

    // Whoever delivers first wins; the other side gets cancelled.
    serve(&torrent, b, &content, &b_reqs[0]);
    assert_eq!(la.take_cancels().len(), 1);
    wait_piece(&torrent, 0).await;
    assert!(torrent.is_complete());
    torrent.check_invariants();
}

// Outside endgame, a strictly better peer (trusted here) steals a live
// request from its current owner: the owner is cancelled and ownership
// moves.
#[test]
fn test_trusted_peer_steals_request_from_worse_owner() {
    let (torrent, _storage, _content) =
        make_torrent_with(Layout::new(2 * 16384, CHUNK, CHUNK), no_endgame());
    let (a, la, _) = add_test_peer(&torrent);
    torrent.on_have_all(a);
    torrent.on_peer_choke(a, false);
    torrent.fill_requests(a);
    la.take_requests();
    assert_eq!(torrent.requesting_peer(0), Some(a));

    let (b, lb, _) = add_test_peer(&torrent);
    torrent.set_peer_trusted(b, true);
    torrent.on_have(b, 0).unwrap();
    torrent.on_peer_choke(b, false);
    torrent.fill_requests(b);

    let b_reqs = lb.take_requests();
    assert_eq!(b_reqs, vec![Request::new(0, 0, CHUNK)]);
    assert_eq!(torrent.requesting_peer(0), Some(b));
    // The worse incumbent got a Cancel and now awaits the ack.
    assert_eq!(la.take_cancels().len(), 1);
    assert!(torrent.peer_requests(a).is_empty());
    assert_eq!(torrent.peer_cancelled(a), vec![0]);
    torrent.check_invariants();
}

// An availability change that reshuffles the request order re-triggers
// peers with pipeline room, even though they are not low on requests.
#[test]
fn test_order_reshape_triggers_peers_with_room() {
    let (torrent, _storage, content) =
        make_torrent_with(Layout::new(4 * 16384, CHUNK, CHUNK), no_endgame());
    let (a, la, _) = add_test_peer(&torrent);
    torrent.on_have_all(a);
    torrent.on_peer_choke(a, false);

    // Grow the pipeline to two, then satisfy one request so the peer has
    // room but is not low (one request still rides).
    torrent.fill_requests(a);
    for req in la.take_requests() {
        serve(&torrent, a, &content, &req);
    }
    torrent.fill_requests(a);
    assert_eq!(la.take_requests().len(), 2);
    serve(&torrent, a, &content, &Request::new(1, 0, CHUNK));
    torrent.fill_requests(a);
    assert!(
        la.take_requests().is_empty(),
        "no trigger is pending while one request rides"
    );

    // A new seeder reshapes the order; the idle room gets filled.
    let (b, _lb, _) = add_test_peer(&torrent);
    torrent.on_have_all(b);
    torrent.fill_requests(a);
    let reqs = la.take_requests();
    assert_eq!(reqs, vec![Request::new(3, 0, CHUNK)]);
    assert_eq!(torrent.requesting_peer(3), Some(a));
    torrent.check_invariants();
}

// Full session over a duplex transport: the remote seeds, the session
// drives interest, requests, receipt and completion, and announces the
// verified pieces back.
#[tokio::test]
async fn test_peer_session_end_to_end() {
    use crate::peer::{read_message, Message, PeerSession};
    use tokio::io::AsyncWriteExt;

    let layout = Layout::new(4 * 16384, CHUNK, CHUNK);
    let (torrent, _storage, content) = make_torrent(layout);
    let session = PeerSession::new(torrent.clone());
    let (local, remote) = tokio::io::duplex(1 << 20);
    let (local_r, local_w) = tokio::io::split(local);
    let run = tokio::spawn(session.run(local_r, local_w));

    let (mut remote_r, mut remote_w) = tokio::io::split(remote);
    remote_w
        .write_all(&Message::HaveAll.encode())
        .await
        .unwrap();
    remote_w
        .write_all(&Message::Unchoke.encode())
        .await
        .unwrap();

    let mut saw_interested = false;
    let mut haves = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !torrent.is_complete() {
            let msg = match tokio::time::timeout(
                Duration::from_millis(50),
                read_message(&mut remote_r),
            )
            .await
            {
                Ok(msg) => msg.unwrap(),
                // Verification may still be settling; re-check completion.
                Err(_) => continue,
            };
            match msg {
                Message::Interested => saw_interested = true,
                Message::Request(r) => {
                    let piece = &content[r.piece as usize];
                    let data = Bytes::copy_from_slice(
                        &piece[r.begin as usize..(r.begin + r.length) as usize],
                    );
                    remote_w
                        .write_all(
                            &Message::Piece {
                                piece: r.piece,
                                begin: r.begin,
                                data,
                            }
                            .encode(),
                        )
                        .await
                        .unwrap();
                }
                Message::Have { piece } => haves.push(piece),
                _ => {}
            }
        }
    })
    .await
    .expect("session never completed the torrent");

    assert!(saw_interested);
    assert!(haves.iter().all(|&p| p < 4));
    drop(remote_r);
    drop(remote_w);
    run.await.unwrap().unwrap();
    assert!(torrent.is_complete());
    assert_eq!(torrent.stats().chunks_written.get(), 4);
}

#[test]
fn test_zero_length_torrent_is_complete() {
    let storage = Arc::new(MemoryStorage::new(&[]));
    let torrent = Torrent::new(
        Layout::new(0, CHUNK, CHUNK),
        Vec::new(),
        storage,
        Arc::new(Sha1Verifier),
        Config::default(),
    );
    assert!(torrent.is_complete());
    assert_eq!(torrent.pending_pieces_snapshot(), Vec::<u32>::new());
}

#[test]
fn test_priority_none_excludes_piece() {
    let (torrent, _storage, _content) =
        make_torrent_with(Layout::new(2 * 16384, CHUNK, CHUNK), no_endgame());
    let (peer, link, _) = add_test_peer(&torrent);
    torrent.on_have_all(peer);
    torrent.on_peer_choke(peer, false);

    assert!(torrent.set_piece_priority(0, Priority::None));
    assert_eq!(torrent.pending_pieces_snapshot(), vec![1]);

    torrent.fill_requests(peer);
    let reqs = link.take_requests();
    assert!(reqs.iter().all(|r| r.piece == 1));
    torrent.check_invariants();
}

#[test]
fn test_choked_peer_requests_only_allowed_fast() {
    let (torrent, _storage, _content) =
        make_torrent_with(Layout::new(4 * 16384, CHUNK, CHUNK), no_endgame());
    let (peer, link, _) = add_test_peer(&torrent);
    torrent.on_have_all(peer);
    // Still choked, but piece 2 is allowed fast.
    torrent.on_allowed_fast(peer, 2).unwrap();

    torrent.fill_requests(peer);
    let reqs = link.take_requests();
    assert!(!reqs.is_empty());
    assert!(reqs.iter().all(|r| r.piece == 2));
    torrent.check_invariants();
}

#[tokio::test]
async fn test_initial_completion_scan_flag_independence() {
    let layout = Layout::new(2 * 16384, CHUNK, CHUNK);
    let content = make_content(&layout);
    let hashes: Vec<_> = content.iter().map(|p| sha1_hash(p)).collect();

    let seeded_storage = || {
        let storage = Arc::new(MemoryStorage::new(&[CHUNK, CHUNK]));
        storage.write_chunk(0, 0, &content[0]).unwrap();
        storage.mark_complete(0).unwrap();
        storage
    };

    // Initial check skipped, stored completion trusted.
    let torrent = Torrent::new(
        layout.clone(),
        hashes.clone(),
        seeded_storage(),
        Arc::new(Sha1Verifier),
        Config {
            disable_initial_piece_check: true,
            ..Config::default()
        },
    );
    assert!(torrent.completed_pieces().has(0));
    assert_eq!(torrent.num_verifies(0), 0);

    // Initial check skipped AND unverified completion ignored: the piece
    // stays pending even though storage says complete.
    let torrent = Torrent::new(
        layout.clone(),
        hashes.clone(),
        seeded_storage(),
        Arc::new(Sha1Verifier),
        Config {
            disable_initial_piece_check: true,
            ignore_unverified_piece_completion: true,
            ..Config::default()
        },
    );
    assert!(!torrent.completed_pieces().has(0));
    assert!(torrent.pending_pieces_snapshot().contains(&0));

    // Initial check enabled: the stored completion is verified and then
    // counted, independent of the ignore flag.
    let torrent = Torrent::new(
        layout,
        hashes,
        seeded_storage(),
        Arc::new(Sha1Verifier),
        Config {
            ignore_unverified_piece_completion: true,
            ..Config::default()
        },
    );
    wait_piece(&torrent, 0).await;
    assert!(torrent.completed_pieces().has(0));
    assert_eq!(torrent.num_verifies(0), 1);
}

#[test]
fn test_requests_capped_by_nominal_max() {
    let layout = Layout::new(64 * 16384, 16 * CHUNK, CHUNK);
    let (torrent, _storage, _content) = make_torrent_with(layout, no_endgame());
    let (peer, link, _) = add_test_peer(&torrent);
    torrent.on_have_all(peer);
    torrent.on_peer_choke(peer, false);
    torrent.fill_requests(peer);
    // Fresh peer: the pipeline starts at one request.
    assert_eq!(link.take_requests().len(), 1);
    assert_eq!(torrent.peer_requests(peer).len(), 1);
    torrent.check_invariants();
}

#[test]
fn test_peer_close_frees_requests_for_others() {
    let (torrent, _storage, _content) =
        make_torrent_with(Layout::new(2 * 16384, CHUNK, CHUNK), no_endgame());
    let (a, _la, _) = add_test_peer(&torrent);
    torrent.on_have_all(a);
    torrent.on_peer_choke(a, false);
    torrent.fill_requests(a);
    assert_eq!(torrent.requesting_peer(0), Some(a));

    // Peer b only has piece 0, which is owned by a, so it idles.
    let (b, lb, _) = add_test_peer(&torrent);
    torrent.on_have(b, 0).unwrap();
    torrent.on_peer_choke(b, false);
    torrent.fill_requests(b);
    assert!(lb.take_requests().is_empty());
    assert_eq!(torrent.piece_availability(0), 2);

    // Closing a cancels its requests, drops its availability, and triggers
    // the idle peer.
    torrent.close_peer(a);
    assert_eq!(torrent.piece_availability(0), 1);
    assert_eq!(torrent.requesting_peer(0), None);

    torrent.fill_requests(b);
    let reqs = lb.take_requests();
    assert!(reqs.iter().any(|r| torrent.layout().request_index(r) == 0));
    assert_eq!(torrent.requesting_peer(0), Some(b));
    torrent.check_invariants();
}

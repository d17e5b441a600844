//! Webseed (BEP-19) support.
//!
//! A webseed is modelled as a pseudo-peer: it registers on the torrent like
//! any peer, claims to have every piece, and is never choked. Instead of
//! wire messages, a fixed pool of requester workers scans the peer's
//! request bitmap, coalesces adjacent request indices into one HTTP range
//! fetch, and routes the returned bytes through the regular chunk receive
//! pipeline. Reusing the request bitmap keeps cancellation, dedup and
//! endgame behavior identical to wire peers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::constants::{
    WEBSEED_BACKOFF_MAX, WEBSEED_COALESCE_CHUNKS, WEBSEED_CONNECT_TIMEOUT, WEBSEED_MAX_WORKERS,
    WEBSEED_READ_TIMEOUT,
};
use crate::layout::{Layout, Request, RequestIndex};
use crate::peer::state::PeerId;
use crate::torrent::{PeerLink, Torrent};

/// Errors from a webseed fetch.
#[derive(Debug, Error)]
pub enum WebseedError {
    /// Server asked us to slow down (503/429); retry after back-off.
    #[error("server temporarily busy")]
    TooFast,

    /// The fetch was aborted locally.
    #[error("cancelled")]
    Cancelled,

    /// Transport-level failure; retry with jittered back-off.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// The resource is gone for good (404/403/410); the webseed is dead.
    #[error("webseed dead: {0}")]
    Dead(StatusCode),

    /// Any other unexpected status.
    #[error("unexpected status: {0}")]
    Status(StatusCode),
}

/// Fetches absolute byte ranges of the torrent's content.
pub trait RangeFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        start: u64,
        length: u64,
    ) -> impl Future<Output = Result<Bytes, WebseedError>> + Send;
}

/// HTTP range fetcher for a single-file webseed URL.
pub struct HttpFetcher {
    client: Client,
    url: String,
}

impl HttpFetcher {
    pub fn new(url: String) -> Result<Self, WebseedError> {
        let client = Client::builder()
            .connect_timeout(WEBSEED_CONNECT_TIMEOUT)
            .read_timeout(WEBSEED_READ_TIMEOUT)
            .build()?;
        Ok(Self { client, url })
    }

    pub fn with_client(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

impl RangeFetcher for HttpFetcher {
    async fn fetch(&self, start: u64, length: u64) -> Result<Bytes, WebseedError> {
        let end = start + length - 1;
        debug!(start, end, url = %self.url, "webseed range fetch");
        let response = self
            .client
            .get(&self.url)
            .header(header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(response.bytes().await?),
            StatusCode::OK => {
                // No range support; the server sent the whole file.
                let bytes = response.bytes().await?;
                let start = start as usize;
                let end = (start + length as usize).min(bytes.len());
                if start >= bytes.len() {
                    return Err(WebseedError::Status(StatusCode::OK));
                }
                Ok(bytes.slice(start..end))
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                Err(WebseedError::TooFast)
            }
            status @ (StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE) => {
                Err(WebseedError::Dead(status))
            }
            status => Err(WebseedError::Status(status)),
        }
    }
}

// One in-flight range fetch, covering a run of adjacent request indices.
struct ActiveFetch {
    first: RequestIndex,
    last: RequestIndex,
    cancel: Arc<Notify>,
}

#[derive(Default)]
struct WebseedShared {
    active: Vec<ActiveFetch>,
    dead: bool,
}

impl WebseedShared {
    fn covers(&self, r: RequestIndex) -> bool {
        self.active.iter().any(|a| a.first <= r && r <= a.last)
    }
}

struct WebseedLink {
    layout: Layout,
    shared: Arc<Mutex<WebseedShared>>,
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl PeerLink for WebseedLink {
    fn send_interested(&self, _interested: bool) {}

    fn send_request(&self, _r: Request) {
        // The wake is lossy on purpose; workers re-scan the request bitmap
        // on their next pass anyway.
        self.wake.notify_one();
    }

    fn send_cancel(&self, r: Request) -> bool {
        let index = self.layout.request_index(&r);
        let shared = self.shared.lock();
        for active in &shared.active {
            if active.first <= index && index <= active.last {
                active.cancel.notify_one();
                // The requester handling the fetch will deliver the ack via
                // its reject path.
                return true;
            }
        }
        // Nothing in flight; the request is simply dropped.
        false
    }

    fn send_have(&self, _piece: u32) {}

    fn wake(&self) {
        self.wake.notify_one();
    }

    fn on_close(&self) {
        self.closed.store(true, Ordering::Release);
        let shared = self.shared.lock();
        for active in &shared.active {
            active.cancel.notify_one();
        }
        drop(shared);
        self.close_notify.notify_waiters();
        self.wake.notify_waiters();
    }

    fn flags(&self) -> &'static str {
        "WS"
    }
}

// What one worker fetches in one pass.
struct Batch {
    first: RequestIndex,
    last: RequestIndex,
    start: u64,
    length: u64,
    cancel: Arc<Notify>,
}

/// A running webseed attached to a torrent.
pub struct Webseed {
    torrent: Arc<Torrent>,
    peer: PeerId,
    shared: Arc<Mutex<WebseedShared>>,
    closed: Arc<AtomicBool>,
}

impl Webseed {
    /// Registers the webseed on the torrent and spawns its requester pool.
    pub fn spawn<F: RangeFetcher>(torrent: Arc<Torrent>, fetcher: F, workers: usize) -> Self {
        let workers = workers.clamp(1, WEBSEED_MAX_WORKERS);
        let shared = Arc::new(Mutex::new(WebseedShared::default()));
        let wake = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        let layout = torrent.layout().clone();
        let (peer, _stats) = torrent.add_peer(|_| {
            let link: Arc<dyn PeerLink> = Arc::new(WebseedLink {
                layout,
                shared: shared.clone(),
                wake: wake.clone(),
                closed: closed.clone(),
                close_notify: close_notify.clone(),
            });
            link
        });
        // A webseed serves everything and has no choke state.
        torrent.on_have_all(peer);
        torrent.on_peer_choke(peer, false);
        torrent
            .set_peer_max_requests(peer, (workers as u32) * WEBSEED_COALESCE_CHUNKS);

        let fetcher = Arc::new(fetcher);
        for i in 0..workers {
            tokio::spawn(requester(
                i,
                torrent.clone(),
                peer,
                fetcher.clone(),
                shared.clone(),
                wake.clone(),
                closed.clone(),
                close_notify.clone(),
            ));
        }
        Self {
            torrent,
            peer,
            shared,
            closed,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// The webseed hit a permanent error and stopped.
    pub fn is_dead(&self) -> bool {
        self.shared.lock().dead
    }

    /// Number of in-flight range fetches.
    pub fn active_fetches(&self) -> usize {
        self.shared.lock().active.len()
    }

    /// Detaches the webseed: aborts in-flight fetches, stops the workers,
    /// and drops the pseudo-peer.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.torrent.close_peer(self.peer);
        }
    }
}

// Claims the next run of unclaimed adjacent request indices, registering it
// as an active fetch. Called under the raw torrent lock.
fn claim_batch(
    layout: &Layout,
    requests: impl Iterator<Item = RequestIndex>,
    shared: &Mutex<WebseedShared>,
) -> Option<Batch> {
    let mut shared = shared.lock();
    let mut run: Option<(RequestIndex, RequestIndex)> = None;
    for r in requests {
        match run {
            None => {
                if !shared.covers(r) {
                    run = Some((r, r));
                }
            }
            Some((first, last)) => {
                let same_piece = layout.piece_of(r) == layout.piece_of(first);
                if r == last + 1 && same_piece && (r - first + 1) <= WEBSEED_COALESCE_CHUNKS {
                    run = Some((first, r));
                } else {
                    break;
                }
            }
        }
    }
    let (first, last) = run?;
    let start = layout.request_offset(&layout.request(first));
    let length: u64 = (first..=last)
        .map(|r| layout.chunk_spec(r).length as u64)
        .sum();
    let cancel = Arc::new(Notify::new());
    shared.active.push(ActiveFetch {
        first,
        last,
        cancel: cancel.clone(),
    });
    Some(Batch {
        first,
        last,
        start,
        length,
        cancel,
    })
}

fn release_batch(shared: &Mutex<WebseedShared>, batch: &Batch) {
    shared.lock().active.retain(|a| a.first != batch.first);
}

#[allow(clippy::too_many_arguments)]
async fn requester<F: RangeFetcher>(
    index: usize,
    torrent: Arc<Torrent>,
    peer: PeerId,
    fetcher: Arc<F>,
    shared: Arc<Mutex<WebseedShared>>,
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
) {
    loop {
        if closed.load(Ordering::Acquire) {
            return;
        }

        // Webseeds have no writer task, so the requester runs the pending
        // scheduler pass itself before scanning for work.
        torrent.fill_requests(peer);

        let batch = {
            let g = torrent.lock.raw_write();
            match g.peers.get(&peer) {
                Some(rec) => claim_batch(torrent.layout(), rec.state.requests.iter(), &shared),
                None => return,
            }
        };

        let Some(batch) = batch else {
            tokio::select! {
                _ = wake.notified() => {}
                _ = close_notify.notified() => return,
            }
            continue;
        };

        // More unclaimed runs may remain; chain the wake so an idle sibling
        // picks one up while this fetch is in flight.
        wake.notify_one();

        let result = tokio::select! {
            res = fetcher.fetch(batch.start, batch.length) => res,
            _ = batch.cancel.notified() => Err(WebseedError::Cancelled),
        };

        if closed.load(Ordering::Acquire) {
            release_batch(&shared, &batch);
            return;
        }

        match result {
            Ok(bytes) => {
                deliver_batch(&torrent, peer, &batch, bytes);
                release_batch(&shared, &batch);
            }
            Err(err) => {
                reject_batch(&torrent, peer, &batch);
                release_batch(&shared, &batch);
                match err {
                    WebseedError::Cancelled => {
                        // Local abort; rescan immediately.
                    }
                    WebseedError::Dead(status) => {
                        warn!(%status, "webseed is gone, dropping it");
                        shared.lock().dead = true;
                        torrent.note_unhandled_peer_err(peer);
                        torrent.close_peer(peer);
                        return;
                    }
                    WebseedError::TooFast => {
                        backoff(index, &close_notify).await;
                    }
                    err => {
                        debug!(requester = index, %err, "webseed fetch failed");
                        torrent.note_unhandled_peer_err(peer);
                        backoff(index, &close_notify).await;
                    }
                }
            }
        }
    }
}

// Slices a fetched range back into chunks and routes each through the
// receive pipeline.
fn deliver_batch(torrent: &Arc<Torrent>, peer: PeerId, batch: &Batch, bytes: Bytes) {
    let mut offset = 0usize;
    for r in batch.first..=batch.last {
        let req = torrent.layout().request(r);
        let end = offset + req.length as usize;
        if end > bytes.len() {
            debug!(r, "webseed returned short range");
            let _ = torrent.remote_rejected(peer, &req);
            continue;
        }
        let chunk = bytes.slice(offset..end);
        offset = end;
        if let Err(err) = torrent.receive_chunk(peer, req.piece, req.begin, chunk) {
            debug!(r, %err, "webseed chunk not accepted");
        }
    }
}

// A failed fetch stands in for a remote reject of every index it covered,
// which also acks any cancels issued while it was in flight.
fn reject_batch(torrent: &Arc<Torrent>, peer: PeerId, batch: &Batch) {
    for r in batch.first..=batch.last {
        let req = torrent.layout().request(r);
        let _ = torrent.remote_rejected(peer, &req);
    }
}

async fn backoff(requester: usize, close_notify: &Notify) {
    let max = WEBSEED_BACKOFF_MAX.as_millis() as u64;
    let sleep = Duration::from_millis(rand::rng().random_range(0..max));
    debug!(requester, ?sleep, "webseed backing off");
    tokio::select! {
        _ = tokio::time::sleep(sleep) => {}
        _ = close_notify.notified() => {}
    }
}

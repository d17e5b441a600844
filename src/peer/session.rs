//! A connected peer after handshake.
//!
//! The session owns the read loop and wires the writer task, the request
//! update timer, and the torrent's transition handlers together. It only
//! speaks the post-handshake protocol; handshaking, encryption and
//! transport setup happen elsewhere.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::layout::Request;
use crate::peer::bitfield::Bitfield;
use crate::peer::error::PeerError;
use crate::peer::message::{read_message, Message, StandardCodec};
use crate::peer::state::{PeerId, UpdateReason};
use crate::peer::writer::MsgWriter;
use crate::stats::ConnStats;
use crate::storage::ChunkStorage;
use crate::torrent::{PeerLink, Torrent};

// The wire-transport side of a session: queues protocol messages into the
// writer buffer. Cancels are acknowledged on the wire (the peer answers
// with Piece or Reject), so send_cancel reports true.
struct WireLink {
    writer: Arc<MsgWriter>,
}

impl PeerLink for WireLink {
    fn send_interested(&self, interested: bool) {
        self.writer.write(&if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    fn send_request(&self, r: Request) {
        self.writer.write(&Message::Request(r));
    }

    fn send_cancel(&self, r: Request) -> bool {
        self.writer.write(&Message::Cancel(r));
        true
    }

    fn send_have(&self, piece: u32) {
        self.writer.write(&Message::Have { piece });
    }

    fn wake(&self) {
        self.writer.wake();
    }

    fn on_close(&self) {
        self.writer.close();
    }

    fn flags(&self) -> &'static str {
        "T"
    }
}

/// A post-handshake peer session.
pub struct PeerSession {
    torrent: Arc<Torrent>,
    peer: PeerId,
    writer: Arc<MsgWriter>,
    stats: Arc<ConnStats>,
    serve_storage: Option<Arc<dyn ChunkStorage>>,
}

impl PeerSession {
    /// Registers a peer on the torrent. The returned session drives it via
    /// [`PeerSession::run`].
    pub fn new(torrent: Arc<Torrent>) -> Self {
        let writer = MsgWriter::new(Arc::new(StandardCodec));
        let link_writer = writer.clone();
        let (peer, stats) = torrent.add_peer(move |_| {
            let link: Arc<dyn PeerLink> = Arc::new(WireLink {
                writer: link_writer,
            });
            link
        });
        Self {
            torrent,
            peer,
            writer,
            stats,
            serve_storage: None,
        }
    }

    /// Enables serving remote Requests from the given storage. Without it
    /// every remote request is rejected.
    pub fn serve_from(mut self, storage: Arc<dyn ChunkStorage>) -> Self {
        self.serve_storage = Some(storage);
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn stats(&self) -> &Arc<ConnStats> {
        &self.stats
    }

    /// Runs the session until the transport closes or errors. Cleans the
    /// peer off the torrent on the way out.
    pub async fn run<R, W>(self, mut read: R, write: W) -> Result<(), PeerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let torrent = self.torrent.clone();
        let peer = self.peer;

        let fill_torrent = torrent.clone();
        let useful_torrent = torrent.clone();
        let writer_task = tokio::spawn(self.writer.clone().run(
            write,
            torrent.config().keep_alive_timeout,
            move || fill_torrent.fill_requests(peer),
            move || useful_torrent.peer_useful(peer),
            self.stats.clone(),
            torrent.config().debug_metrics,
        ));

        // Coalesces bursty triggers; each expiry marks the peer for a fresh
        // scheduler pass.
        let timer_torrent = torrent.clone();
        let timer_writer = self.writer.clone();
        let timer = tokio::spawn(async move {
            let mut ticks =
                tokio::time::interval(timer_torrent.config().update_requests_interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if timer_writer.is_closed() {
                    return;
                }
                timer_torrent.trigger_update(peer, UpdateReason::Timer);
            }
        });

        let result = loop {
            let msg = match read_message(&mut read).await {
                Ok(msg) => msg,
                Err(err) => break Err(err),
            };
            if let Err(err) = self.handle_message(msg) {
                break Err(err);
            }
            if self.writer.is_closed() {
                break Ok(());
            }
        };

        timer.abort();
        self.writer.close();
        torrent.close_peer(peer);
        let _ = writer_task.await;

        match result {
            Err(PeerError::ConnectionClosed) => Ok(()),
            Err(err) => {
                debug!(?peer, %err, "closing peer");
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Applies one wire message to the torrent state machine.
    pub fn handle_message(&self, msg: Message) -> Result<(), PeerError> {
        let t = &self.torrent;
        let peer = self.peer;
        match msg {
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                t.on_peer_choke(peer, true);
                Ok(())
            }
            Message::Unchoke => {
                t.on_peer_choke(peer, false);
                Ok(())
            }
            Message::Interested => {
                t.on_peer_interested(peer, true);
                Ok(())
            }
            Message::NotInterested => {
                t.on_peer_interested(peer, false);
                Ok(())
            }
            Message::Have { piece } => t.on_have(peer, piece),
            Message::Bitfield(bits) => {
                let piece_count = t.layout().piece_count() as usize;
                t.on_bitfield(peer, Bitfield::from_bytes(bits, piece_count));
                Ok(())
            }
            Message::HaveAll => {
                t.on_have_all(peer);
                Ok(())
            }
            Message::HaveNone => {
                t.on_have_none(peer);
                Ok(())
            }
            Message::AllowedFast { piece } => t.on_allowed_fast(peer, piece),
            Message::Request(r) => self.on_remote_request(r),
            Message::Cancel(r) => {
                // Requests are served inline, so there is nothing queued to
                // drop by the time a cancel can arrive.
                trace!(?r, "remote cancel");
                Ok(())
            }
            Message::Piece { piece, begin, data } => self.on_piece(piece, begin, data),
            Message::Reject(r) => t.remote_rejected(peer, &r),
            Message::Extended { id, payload } => {
                trace!(id, len = payload.len(), "extension message");
                Ok(())
            }
        }
    }

    fn on_piece(&self, piece: u32, begin: u32, data: Bytes) -> Result<(), PeerError> {
        self.torrent.receive_chunk(self.peer, piece, begin, data)
    }

    fn on_remote_request(&self, r: Request) -> Result<(), PeerError> {
        if r.length > crate::constants::MAX_REQUEST_LENGTH {
            return Err(PeerError::Protocol(format!(
                "request length {} too large",
                r.length
            )));
        }
        let Some(storage) = &self.serve_storage else {
            self.writer.write(&Message::Reject(r));
            return Ok(());
        };
        if !self.torrent.layout().valid_request(&r)
            || !self.torrent.completed_pieces().has(r.piece as usize)
        {
            self.writer.write(&Message::Reject(r));
            return Ok(());
        }
        let mut data = vec![0u8; r.length as usize];
        match storage.read_at(r.piece, r.begin, &mut data) {
            Ok(n) if n == data.len() => {
                self.writer.write(&Message::Piece {
                    piece: r.piece,
                    begin: r.begin,
                    data: Bytes::from(data),
                });
            }
            Ok(_) | Err(_) => {
                self.writer.write(&Message::Reject(r));
            }
        }
        Ok(())
    }
}

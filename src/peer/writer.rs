//! The peer message writer.
//!
//! A writer task owns two buffers: a back buffer that protocol code fills
//! under a small mutex, and a front buffer being written to the transport.
//! Before each write the task runs a fill callback (which runs the
//! scheduler and appends any Interested/Request/Cancel traffic); the fill
//! always runs before the buffer-empty wait so freshly set update triggers
//! cannot be missed. Fills within a short gap of the previous one are
//! coalesced. When the buffer stays empty past the keep-alive timeout and
//! the peer is useful, a keep-alive is written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{MIN_FILL_GAP, WRITE_BUFFER_HIGH_WATER};
use crate::peer::message::{Message, WireCodec};
use crate::stats::ConnStats;

struct WriterShared {
    buffer: BytesMut,
    piece_data_bytes: usize,
    last_fill: Option<Instant>,
}

/// Shared handle to a peer's outgoing message buffer.
pub struct MsgWriter {
    codec: Arc<dyn WireCodec>,
    shared: Mutex<WriterShared>,
    write_cond: Notify,
    closed: AtomicBool,
}

impl MsgWriter {
    pub fn new(codec: Arc<dyn WireCodec>) -> Arc<Self> {
        Arc::new(Self {
            codec,
            shared: Mutex::new(WriterShared {
                buffer: BytesMut::new(),
                piece_data_bytes: 0,
                last_fill: None,
            }),
            write_cond: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Appends a message and wakes the writer task. Returns false when the
    /// buffer is at or above the high-water mark, i.e. the caller should
    /// stop queueing.
    ///
    /// A codec failure leaves the buffer exactly as it was.
    pub fn write(&self, msg: &Message) -> bool {
        let mut s = self.shared.lock();
        let original_len = s.buffer.len();
        match self.codec.write_message(&mut s.buffer, msg) {
            Ok(_) => s.piece_data_bytes += msg.piece_data_len(),
            Err(err) => {
                warn!(%err, "encoding message");
                s.buffer.truncate(original_len);
            }
        }
        self.write_cond.notify_one();
        s.buffer.len() < WRITE_BUFFER_HIGH_WATER
    }

    /// Wakes the writer task so its fill callback runs.
    pub fn wake(&self) {
        self.write_cond.notify_one();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.write_cond.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bytes currently queued.
    pub fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Drives the transport until closed or the transport errors.
    ///
    /// `fill` must not be called with the writer's own mutex held; it takes
    /// the torrent lock and calls back into [`MsgWriter::write`].
    pub async fn run<W>(
        self: Arc<Self>,
        mut transport: W,
        keep_alive_timeout: Duration,
        fill: impl Fn(),
        useful: impl Fn() -> bool,
        stats: Arc<ConnStats>,
        debug_metrics: bool,
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut last_write = Instant::now();
        let mut front = BytesMut::new();
        loop {
            if self.is_closed() {
                return;
            }

            let (has_space, coalescing) = {
                let s = self.shared.lock();
                (
                    s.buffer.len() < WRITE_BUFFER_HIGH_WATER,
                    s.last_fill.is_some_and(|t| t.elapsed() < MIN_FILL_GAP),
                )
            };
            if has_space && !coalescing {
                fill();
                self.shared.lock().last_fill = Some(Instant::now());
            }

            let wait = {
                let mut s = self.shared.lock();
                let mut empty = s.buffer.is_empty();
                if empty && last_write.elapsed() >= keep_alive_timeout && useful() {
                    let _ = self.codec.write_message(&mut s.buffer, &Message::KeepAlive);
                    if debug_metrics {
                        stats.written_keepalives.inc();
                    }
                    empty = false;
                }
                if empty {
                    true
                } else {
                    // Flip the buffers.
                    std::mem::swap(&mut front, &mut s.buffer);
                    s.piece_data_bytes = 0;
                    false
                }
            };

            if wait {
                tokio::select! {
                    _ = self.write_cond.notified() => {}
                    _ = tokio::time::sleep_until(last_write + keep_alive_timeout) => {}
                }
                continue;
            }

            if let Err(err) = transport.write_all(&front).await {
                debug!(%err, "writing to peer");
                self.close();
                return;
            }
            if let Err(err) = transport.flush().await {
                debug!(%err, "flushing peer transport");
                self.close();
                return;
            }
            front.clear();
            last_write = Instant::now();
        }
    }
}

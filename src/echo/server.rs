use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::message;
use crate::error::Result;
use crate::peer::PeerConnection;
use crate::poller::CompletionHandler;
use crate::provider::Cm;
use crate::rdma::cq::Wc;

/// Counters of a running echo server.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicUsize,
    active: AtomicUsize,
    closed: AtomicUsize,
    echoed: AtomicUsize,
}

impl ServerStats {
    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    /// Connections currently open.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Connections torn down so far.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    /// Messages echoed back so far.
    pub fn echoed(&self) -> usize {
        self.echoed.load(Ordering::Acquire)
    }

    pub(crate) fn on_accept(&self) {
        self.accepted.fetch_add(1, Ordering::AcqRel);
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_close(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.closed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Echoes every received message back to its sender.
///
/// A receive completion copies the message into the send buffer and posts
/// it; the send completion clears both buffers and re-arms a receive. Each
/// connection thus has exactly one of the two outstanding at a time.
///
/// Every message received and sent is reported on stdout, or on the writer
/// given to [`ServerHandler::with_output`].
pub struct ServerHandler {
    stats: Arc<ServerStats>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ServerHandler {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self::with_output(stats, io::stdout())
    }

    pub fn with_output(stats: Arc<ServerStats>, out: impl Write + Send + 'static) -> Self {
        Self {
            stats,
            out: Mutex::new(Box::new(out)),
        }
    }

    fn report(&self, line: std::fmt::Arguments<'_>) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = out.write_fmt(line).and_then(|_| out.write_all(b"\n")) {
            log::warn!("cannot write server output: {}", e);
        }
    }
}

impl<P: Cm> CompletionHandler<P> for ServerHandler {
    fn on_recv(&self, conn: &PeerConnection<P>, wc: &Wc) -> Result<()> {
        let text = conn.with_buffers(|bufs| {
            let text = message::text(bufs.recv).into_owned();
            bufs.send.copy_from_slice(bufs.recv);
            bufs.recv.fill(0);
            text
        })?;
        log::debug!("connection {} received {} bytes", conn.id(), wc.bytes());
        self.report(format_args!("[{}] received: {}", conn.id(), text));
        self.stats.echoed.fetch_add(1, Ordering::AcqRel);
        conn.post_send()
    }

    fn on_send(&self, conn: &PeerConnection<P>, _wc: &Wc) -> Result<()> {
        let text = conn.with_buffers(|bufs| {
            let text = message::text(bufs.send).into_owned();
            bufs.send.fill(0);
            bufs.recv.fill(0);
            text
        })?;
        self.report(format_args!("[{}] sent: {}", conn.id(), text));
        conn.post_recv()
    }
}

use std::sync::mpsc::Sender;
use std::sync::Mutex;

use crate::error::Result;
use crate::peer::{ConnId, PeerConnection};
use crate::poller::CompletionHandler;
use crate::provider::Cm;
use crate::rdma::cq::{Wc, WcStatus};

/// What the client's completion handler observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A message left the send buffer.
    Sent(ConnId),
    /// A reply arrived; holds the received bytes.
    Received(ConnId, Vec<u8>),
    /// A work request failed.
    Failed(Option<ConnId>, WcStatus),
}

/// Forwards the client's completions to its session.
///
/// The client posts its own receives, so this handler only observes.
pub struct ClientHandler {
    events: Mutex<Sender<ClientEvent>>,
}

impl ClientHandler {
    pub fn new(events: Sender<ClientEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    fn forward(&self, event: ClientEvent) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.send(event).is_err() {
            log::debug!("client session is gone, dropping completion");
        }
    }
}

impl<P: Cm> CompletionHandler<P> for ClientHandler {
    fn on_recv(&self, conn: &PeerConnection<P>, wc: &Wc) -> Result<()> {
        let reply = conn.with_buffers(|bufs| {
            let len = wc.bytes().min(bufs.recv.len());
            bufs.recv[..len].to_vec()
        })?;
        log::debug!("connection {} received {} bytes", conn.id(), reply.len());
        self.forward(ClientEvent::Received(conn.id(), reply));
        Ok(())
    }

    fn on_send(&self, conn: &PeerConnection<P>, _wc: &Wc) -> Result<()> {
        log::debug!("connection {} send completed", conn.id());
        self.forward(ClientEvent::Sent(conn.id()));
        Ok(())
    }

    fn on_error(&self, conn: Option<&PeerConnection<P>>, wc: &Wc) {
        let id = conn.map(PeerConnection::id);
        log::warn!("work request on connection {:?} failed: {}", id, wc.status());
        self.forward(ClientEvent::Failed(id, wc.status()));
    }
}

//! The completion poller: one background thread per transport context that
//! sleeps on the completion channel and hands every completion to the
//! role's [`CompletionHandler`].

use std::io;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::context::TransportContext;
use crate::error::{Error, ProviderResultExt, Result};
use crate::peer::{ConnId, PeerConnection};
use crate::provider::{Cm, Verbs};
use crate::rdma::cq::{Wc, WcOpcode};

/// Role-specific reaction to completions.
///
/// Errors returned from `on_recv` and `on_send` are fatal.
pub trait CompletionHandler<P: Cm>: Send + Sync + 'static {
    /// A receive completed successfully on `conn`.
    fn on_recv(&self, conn: &PeerConnection<P>, wc: &Wc) -> Result<()>;

    /// A send completed successfully on `conn`.
    fn on_send(&self, conn: &PeerConnection<P>, wc: &Wc) -> Result<()>;

    /// A work request failed. `conn` is `None` if it is already destroyed.
    fn on_error(&self, conn: Option<&PeerConnection<P>>, wc: &Wc) {
        log::warn!(
            "work request {} on connection {:?} failed: {}",
            wc.wr_id(),
            conn.map(PeerConnection::id),
            wc.status()
        );
    }
}

pub(crate) fn spawn<P: Cm>(
    ctx: Arc<TransportContext<P>>,
    handler: Arc<dyn CompletionHandler<P>>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("cq-poller".to_owned())
        .spawn(move || {
            if let Err(e) = run(&ctx, handler.as_ref()) {
                log::error!("completion poller failed: {}", e);
                process::exit(1);
            }
        })
}

fn run<P: Cm>(ctx: &TransportContext<P>, handler: &dyn CompletionHandler<P>) -> Result<()> {
    loop {
        poll_once(ctx, handler)?;
    }
}

/// Wait for one notification and drain the CQ. Returns the number of
/// completions dispatched.
///
/// The CQ is re-armed before draining, so a completion arriving during the
/// drain raises a fresh notification instead of being left behind.
pub(crate) fn poll_once<P: Cm>(
    ctx: &TransportContext<P>,
    handler: &dyn CompletionHandler<P>,
) -> Result<usize> {
    let provider = ctx.provider();
    provider
        .get_cq_event(&ctx.channel)
        .during("ibv_get_cq_event")?;
    provider.ack_cq_events(&ctx.cq, 1);
    provider.req_notify_cq(&ctx.cq).during("ibv_req_notify_cq")?;

    let mut polled = 0;
    while let Some(wc) = provider.poll_cq(&ctx.cq).during("ibv_poll_cq")? {
        dispatch(ctx, handler, &wc)?;
        polled += 1;
    }
    Ok(polled)
}

fn dispatch<P: Cm>(
    ctx: &TransportContext<P>,
    handler: &dyn CompletionHandler<P>,
    wc: &Wc,
) -> Result<()> {
    log::debug!("got work completion: {:?}", wc);

    let conn = ctx.lookup(ConnId(wc.wr_id()));
    if wc.ok().is_err() {
        handler.on_error(conn.as_deref(), wc);
        return Ok(());
    }
    let Some(conn) = conn else {
        log::debug!("skipping completion of released connection {}", wc.wr_id());
        return Ok(());
    };

    let ret = match wc.opcode() {
        Some(op) if op.is_recv() => handler.on_recv(&conn, wc),
        Some(WcOpcode::Send) => handler.on_send(&conn, wc),
        op => {
            log::warn!("unexpected completion opcode {:?} on {}", op, conn.id());
            Ok(())
        }
    };
    match ret {
        // Torn down by the CM thread while the handler ran.
        Err(Error::Destroyed(id)) => {
            log::debug!("connection {} released during completion handling", id);
            Ok(())
        }
        ret => ret,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::echo::message;
    use crate::peer::tests::connected_pair;
    use crate::provider::sim::SimProvider;
    use crate::rdma::cq::WcStatus;

    #[derive(Debug, PartialEq, Eq)]
    pub(crate) enum Seen {
        Recv(ConnId, String),
        Send(ConnId),
        Error(Option<ConnId>, WcStatus),
    }

    /// Records every completion it sees.
    pub(crate) struct Recorder(Mutex<Sender<Seen>>);

    impl Recorder {
        pub(crate) fn new() -> (Arc<dyn CompletionHandler<SimProvider>>, Receiver<Seen>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Recorder(Mutex::new(tx))), rx)
        }

        pub(crate) fn handler() -> Arc<dyn CompletionHandler<SimProvider>> {
            Self::new().0
        }

        fn record(&self, seen: Seen) {
            let _ = self.0.lock().unwrap().send(seen);
        }
    }

    impl<P: Cm> CompletionHandler<P> for Recorder {
        fn on_recv(&self, conn: &PeerConnection<P>, _wc: &Wc) -> Result<()> {
            let text = conn.with_buffers(|bufs| message::text(bufs.recv).into_owned())?;
            self.record(Seen::Recv(conn.id(), text));
            Ok(())
        }

        fn on_send(&self, conn: &PeerConnection<P>, _wc: &Wc) -> Result<()> {
            self.record(Seen::Send(conn.id()));
            Ok(())
        }

        fn on_error(&self, conn: Option<&PeerConnection<P>>, wc: &Wc) {
            self.record(Seen::Error(conn.map(PeerConnection::id), wc.status()));
        }
    }

    fn seen(rx: &Receiver<Seen>) -> Seen {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn completions_in_fifo_order() {
        let pair = connected_pair();
        let (a, b) = (&pair.a, &pair.b);

        for msg in ["one", "two", "three"] {
            a.with_buffers(|bufs| message::fill(bufs.send, msg.as_bytes()))
                .unwrap();
            a.post_send().unwrap();
            assert_eq!(seen(&pair.a_seen), Seen::Send(a.id()));
            assert_eq!(seen(&pair.b_seen), Seen::Recv(b.id(), msg.to_owned()));
            b.post_recv().unwrap();
        }
    }

    #[test]
    fn early_sends_wait_for_receives() {
        let pair = connected_pair();
        let (a, b) = (&pair.a, &pair.b);

        // `b` has one receive posted; the second message waits for another.
        for msg in ["first", "second"] {
            a.with_buffers(|bufs| message::fill(bufs.send, msg.as_bytes()))
                .unwrap();
            a.post_send().unwrap();
            assert_eq!(seen(&pair.a_seen), Seen::Send(a.id()));
        }
        assert_eq!(seen(&pair.b_seen), Seen::Recv(b.id(), "first".to_owned()));
        assert!(pair.b_seen.recv_timeout(Duration::from_millis(100)).is_err());

        b.post_recv().unwrap();
        assert_eq!(seen(&pair.b_seen), Seen::Recv(b.id(), "second".to_owned()));
    }

    #[test]
    fn disconnect_flushes_receives() {
        let pair = connected_pair();
        pair.provider.disconnect(pair.a.endpoint()).unwrap();

        assert_eq!(
            seen(&pair.a_seen),
            Seen::Error(Some(pair.a.id()), WcStatus::WrFlushErr)
        );
        assert_eq!(
            seen(&pair.b_seen),
            Seen::Error(Some(pair.b.id()), WcStatus::WrFlushErr)
        );
    }
}

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::{TransportContext, TransportSlot};
use crate::echo::message::BUFFER_SIZE;
use crate::error::{Error, ProviderResultExt, Result};
use crate::poller::CompletionHandler;
use crate::provider::{Cm, Verbs};
use crate::rdma::{
    mr::{MemoryRegion, Permission},
    wr::{RecvWr, SendWr, Sge},
};

/// Identity of a [`PeerConnection`] within its transport context.
///
/// Carried as the work request ID of everything the connection posts, so
/// completions can be routed back to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Both message buffers of a connection.
pub struct Buffers<'a> {
    pub send: &'a mut [u8],
    pub recv: &'a mut [u8],
}

struct RegisteredBuf<P: Verbs> {
    mr: P::Mr,
    buf: Box<[u8]>,
}

impl<P: Verbs> RegisteredBuf<P> {
    /// Allocate a zeroed buffer and register it.
    fn new(provider: &P, pd: &P::Pd, perm: Permission) -> Result<Self> {
        let mut buf = vec![0u8; BUFFER_SIZE].into_boxed_slice();
        // SAFETY: the buffer is heap-allocated, so it does not move with
        // `Self`, and it is only freed by `release` once deregistered.
        let mr = unsafe { provider.reg_mr(pd, buf.as_mut_ptr(), buf.len(), perm) }
            .during("ibv_reg_mr")?;
        Ok(Self { mr, buf })
    }

    fn sge(&self) -> Sge {
        Sge::new(&self.buf, self.mr.lkey())
    }

    /// Deregister, then free the buffer. The buffer is leaked if the
    /// region cannot be deregistered.
    fn release(self, provider: &P) -> io::Result<()> {
        let Self { mr, buf } = self;
        match provider.dereg_mr(mr) {
            Ok(()) => Ok(()),
            Err(e) => {
                Box::leak(buf);
                Err(e)
            }
        }
    }
}

struct Resources<P: Verbs> {
    qp: P::Qp,
    send: RegisteredBuf<P>,
    recv: RegisteredBuf<P>,
}

impl<P: Cm> Resources<P> {
    /// Release the queue pair, then both regions with their buffers.
    fn release(self, provider: &P, endpoint: &P::Id) -> Result<()> {
        provider.destroy_qp(endpoint, self.qp);
        let recv = self.recv.release(provider).during("ibv_dereg_mr");
        let send = self.send.release(provider).during("ibv_dereg_mr");
        recv.and(send)
    }
}

/// A connection's queue pair and its two registered message buffers.
///
/// Built by [`PeerConnection::initialize`] and released only by
/// [`PeerConnection::destroy`].
pub struct PeerConnection<P: Cm> {
    id: ConnId,
    ctx: Arc<TransportContext<P>>,
    endpoint: P::Id,
    peer: Option<SocketAddr>,
    res: Mutex<Option<Resources<P>>>,
}

impl<P: Cm> PeerConnection<P> {
    /// Build the connection for `endpoint`, with one receive already posted.
    ///
    /// The transport context is created on first use, with `handler`
    /// receiving its completions.
    ///
    /// On failure whatever was built is released, queue pair first; the
    /// endpoint stays with the caller.
    pub fn initialize(
        slot: &TransportSlot<P>,
        endpoint: P::Id,
        handler: &Arc<dyn CompletionHandler<P>>,
    ) -> Result<Arc<Self>> {
        let provider = slot.provider();
        let device = provider.device(&endpoint).ok_or(Error::NoDevice)?;
        let ctx = slot.get_or_create(&device, handler)?;

        let qp = provider
            .create_qp(&endpoint, &ctx.pd, &ctx.cq, slot.qp_caps())
            .during("rdma_create_qp")?;
        let recv = match RegisteredBuf::new(
            provider,
            &ctx.pd,
            Permission::LOCAL_WRITE | Permission::REMOTE_WRITE,
        ) {
            Ok(recv) => recv,
            Err(e) => {
                provider.destroy_qp(&endpoint, qp);
                return Err(e);
            }
        };
        let send = match RegisteredBuf::new(
            provider,
            &ctx.pd,
            Permission::LOCAL_WRITE | Permission::REMOTE_READ,
        ) {
            Ok(send) => send,
            Err(e) => {
                provider.destroy_qp(&endpoint, qp);
                let _ = recv.release(provider);
                return Err(e);
            }
        };

        let conn = Arc::new(Self {
            id: ctx.next_conn_id(),
            ctx: ctx.clone(),
            peer: provider.peer_addr(&endpoint),
            endpoint,
            res: Mutex::new(Some(Resources { qp, send, recv })),
        });

        // Registered before the first receive, so its completion finds us.
        ctx.register(conn.clone());
        if let Err(e) = conn.post_recv() {
            ctx.unregister(conn.id);
            let res = conn.resources().take();
            if let Some(res) = res {
                let _ = res.release(provider, &conn.endpoint);
            }
            return Err(e);
        }
        log::debug!("connection {} built on {:?}", conn.id, conn.endpoint);
        Ok(conn)
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn endpoint(&self) -> &P::Id {
        &self.endpoint
    }

    /// Address of the remote side, as seen when the connection was built.
    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn context(&self) -> &Arc<TransportContext<P>> {
        &self.ctx
    }

    pub fn is_destroyed(&self) -> bool {
        self.resources().is_none()
    }

    fn resources(&self) -> MutexGuard<'_, Option<Resources<P>>> {
        self.res.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Access both message buffers.
    pub fn with_buffers<R>(&self, f: impl FnOnce(Buffers<'_>) -> R) -> Result<R> {
        let mut res = self.resources();
        let res = res.as_mut().ok_or(Error::Destroyed(self.id))?;
        Ok(f(Buffers {
            send: &mut res.send.buf,
            recv: &mut res.recv.buf,
        }))
    }

    /// Post a signaled send of the whole send buffer.
    pub fn post_send(&self) -> Result<()> {
        let res = self.resources();
        let res = res.as_ref().ok_or(Error::Destroyed(self.id))?;
        let wr = SendWr {
            wr_id: self.id.0,
            sge: res.send.sge(),
            signaled: true,
        };
        self.ctx
            .provider()
            .post_send(&res.qp, &wr)
            .during("ibv_post_send")
    }

    /// Post a receive into the whole receive buffer.
    pub fn post_recv(&self) -> Result<()> {
        let res = self.resources();
        let res = res.as_ref().ok_or(Error::Destroyed(self.id))?;
        let wr = RecvWr {
            wr_id: self.id.0,
            sge: res.recv.sge(),
        };
        self.ctx
            .provider()
            .post_recv(&res.qp, &wr)
            .during("ibv_post_recv")
    }

    /// Release the queue pair, then both memory regions, then the buffers,
    /// and finally the endpoint.
    ///
    /// Only the first call does anything; later ones return
    /// [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let res = self.resources().take().ok_or(Error::Destroyed(self.id))?;
        self.ctx.unregister(self.id);

        let provider = self.ctx.provider();
        res.release(provider, &self.endpoint)?;
        provider
            .destroy_id(&self.endpoint)
            .during("rdma_destroy_id")?;

        log::debug!("connection {} destroyed", self.id);
        Ok(())
    }
}

impl<P: Cm> fmt::Debug for PeerConnection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    use super::*;
    use crate::cm::{CmEvent, CmEventKind, ConnParam};
    use crate::poller::tests::{Recorder, Seen};
    use crate::provider::sim::{Release, SimEventChannel, SimId, SimProvider};
    use crate::rdma::qp::QpCaps;

    pub(crate) struct Pair {
        pub provider: SimProvider,
        pub a: Arc<PeerConnection<SimProvider>>,
        pub b: Arc<PeerConnection<SimProvider>>,
        pub a_seen: Receiver<Seen>,
        pub b_seen: Receiver<Seen>,
    }

    fn next(provider: &SimProvider, channel: &SimEventChannel) -> CmEvent<SimId> {
        let record = provider.get_cm_event(channel).unwrap();
        let event = provider.event_payload(&record);
        provider.ack_cm_event(record).unwrap();
        event
    }

    fn slot(provider: &SimProvider) -> TransportSlot<SimProvider> {
        TransportSlot::new(provider.clone(), 10, QpCaps::default())
    }

    /// Two connections on separate transport contexts, wired to each other.
    pub(crate) fn connected_pair() -> Pair {
        let provider = SimProvider::new();
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let timeout = Duration::from_millis(500);

        let b_channel = provider.create_event_channel().unwrap();
        let listener = provider.create_id(&b_channel).unwrap();
        provider.bind_addr(&listener, addr).unwrap();
        provider.listen(&listener, 10).unwrap();

        let a_channel = provider.create_event_channel().unwrap();
        let a_id = provider.create_id(&a_channel).unwrap();
        provider.resolve_addr(&a_id, addr, timeout).unwrap();
        next(&provider, &a_channel);
        provider.resolve_route(&a_id, timeout).unwrap();
        next(&provider, &a_channel);

        let (a_handler, a_seen) = Recorder::new();
        let a = PeerConnection::initialize(&slot(&provider), a_id.clone(), &a_handler).unwrap();
        provider.connect(&a_id, &ConnParam::default()).unwrap();

        let request = next(&provider, &b_channel);
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        let (b_handler, b_seen) = Recorder::new();
        let b = PeerConnection::initialize(&slot(&provider), request.id.clone(), &b_handler)
            .unwrap();
        provider.accept(&request.id, &ConnParam::default()).unwrap();
        assert_eq!(next(&provider, &b_channel).kind, CmEventKind::Established);
        assert_eq!(next(&provider, &a_channel).kind, CmEventKind::Established);

        Pair {
            provider,
            a,
            b,
            a_seen,
            b_seen,
        }
    }

    #[test]
    fn initialize_registers_and_posts() {
        let pair = connected_pair();
        assert_eq!(pair.provider.registered_mrs(), 4);
        assert_eq!(pair.a.context().connections(), 1);
        assert!(pair.a.context().lookup(pair.a.id()).is_some());
        assert_eq!(
            pair.b.peer_addr(),
            pair.provider.local_addr(pair.a.endpoint())
        );
        pair.a
            .with_buffers(|bufs| {
                assert_eq!(bufs.send.len(), BUFFER_SIZE);
                assert!(bufs.recv.iter().all(|&b| b == 0));
            })
            .unwrap();
    }

    #[test]
    fn destroy_exactly_once() {
        let pair = connected_pair();
        pair.provider.disconnect(pair.a.endpoint()).unwrap();

        pair.a.destroy().unwrap();
        assert!(pair.a.is_destroyed());
        assert_eq!(pair.a.context().connections(), 0);
        assert_eq!(pair.provider.registered_mrs(), 2);

        // Queue pair, then both regions, then the endpoint.
        let handle = pair.a.endpoint().handle();
        let released = pair.provider.releases();
        assert_eq!(released.len(), 4);
        assert_eq!(released[0], Release::Qp(handle));
        assert!(matches!(released[1], Release::Mr(_)));
        assert!(matches!(released[2], Release::Mr(_)));
        assert_ne!(released[1], released[2]);
        assert_eq!(released[3], Release::Id(handle));

        assert!(matches!(pair.a.destroy(), Err(Error::Destroyed(id)) if id == pair.a.id()));
        assert!(matches!(pair.a.post_send(), Err(Error::Destroyed(_))));
        assert!(matches!(pair.a.with_buffers(|_| ()), Err(Error::Destroyed(_))));

        // The other side is unaffected until it tears down too.
        assert!(!pair.b.is_destroyed());
        pair.b.destroy().unwrap();
        assert_eq!(pair.provider.registered_mrs(), 0);
        assert_eq!(pair.provider.releases().len(), 8);
    }

    #[test]
    fn partial_resources_release_in_order() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let id = provider.create_id(&channel).unwrap();
        provider
            .resolve_addr(&id, "127.0.0.1:7001".parse().unwrap(), Duration::from_millis(500))
            .unwrap();
        next(&provider, &channel);

        let slot = slot(&provider);
        let ctx = slot
            .get_or_create(&provider.device(&id).unwrap(), &Recorder::handler())
            .unwrap();
        let qp = provider
            .create_qp(&id, &ctx.pd, &ctx.cq, &QpCaps::default())
            .unwrap();
        let recv = RegisteredBuf::new(&provider, &ctx.pd, Permission::LOCAL_WRITE).unwrap();
        let send = RegisteredBuf::new(&provider, &ctx.pd, Permission::LOCAL_WRITE).unwrap();
        let (recv_key, send_key) = (recv.mr.lkey(), send.mr.lkey());
        assert_eq!(provider.registered_mrs(), 2);

        Resources { qp, send, recv }.release(&provider, &id).unwrap();
        assert_eq!(
            provider.releases(),
            [
                Release::Qp(id.handle()),
                Release::Mr(recv_key),
                Release::Mr(send_key)
            ]
        );
        assert_eq!(provider.registered_mrs(), 0);
        // The endpoint is still the caller's.
        provider.destroy_id(&id).unwrap();
    }

    #[test]
    fn unbound_endpoint() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let id = provider.create_id(&channel).unwrap();
        let err = PeerConnection::initialize(&slot(&provider), id, &Recorder::handler())
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoDevice));
    }

    #[test]
    fn receive_queue_is_bounded() {
        let pair = connected_pair();
        // One receive is posted by `initialize`.
        for _ in 1..QpCaps::default().max_recv_wr {
            pair.b.post_recv().unwrap();
        }
        match pair.b.post_recv() {
            Err(Error::Provider { op, source }) => {
                assert_eq!(op, "ibv_post_recv");
                assert_eq!(source.raw_os_error(), Some(libc::ENOMEM));
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }
}

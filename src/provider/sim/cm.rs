use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use super::{Fabric, Release, SimCq, SimDevice, SimPd, SimProvider, SimQp};
use crate::cm::{CmEvent, CmEventKind, ConnParam};
use crate::provider::Cm;
use crate::rdma::qp::QpCaps;

#[derive(Default)]
struct EventQueue {
    events: Mutex<VecDeque<CmEvent<SimId>>>,
    cond: Condvar,
}

/// Simulated CM event channel.
#[derive(Clone, Default)]
pub struct SimEventChannel(Arc<EventQueue>);

impl SimEventChannel {
    fn push(&self, event: CmEvent<SimId>) {
        let mut events = self.0.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        self.0.cond.notify_one();
    }

    fn pop(&self) -> CmEvent<SimId> {
        let mut events = self.0.events.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(event) = events.pop_front() {
                return event;
            }
            events = self.0.cond.wait(events).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// A retrieved, not yet acknowledged, CM event.
pub struct SimEventRecord(CmEvent<SimId>);

struct Backlog {
    max: usize,
    pending: usize,
}

#[derive(Default)]
struct IdState {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    device: Option<SimDevice>,
    route_resolved: bool,
    qp: Option<SimQp>,
    /// The other side of the connection.
    peer: Option<Weak<IdInner>>,
    /// The listener that surfaced this endpoint.
    listener: Option<Weak<IdInner>>,
    backlog: Option<Backlog>,
    accepted: bool,
    connected: bool,
    destroyed: bool,
}

pub(crate) struct IdInner {
    handle: u64,
    channel: SimEventChannel,
    state: Mutex<IdState>,
}

impl IdInner {
    pub(super) fn handle(&self) -> u64 {
        self.handle
    }
}

/// Simulated CM endpoint. Clones refer to the same endpoint.
#[derive(Clone)]
pub struct SimId(Arc<IdInner>);

impl SimId {
    fn new(fabric: &Fabric, channel: SimEventChannel) -> Self {
        Self(Arc::new(IdInner {
            handle: fabric.next_handle(),
            channel,
            state: Mutex::new(IdState::default()),
        }))
    }

    pub(super) fn from_inner(inner: Arc<IdInner>) -> Self {
        Self(inner)
    }

    /// Fabric-wide handle, shared with the endpoint's queue pair.
    pub fn handle(&self) -> u64 {
        self.0.handle
    }

    fn state(&self) -> MutexGuard<'_, IdState> {
        self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn event(&self, kind: CmEventKind) {
        self.0.channel.push(CmEvent::new(kind, self.clone()));
    }

    fn event_with_status(&self, kind: CmEventKind, status: i32) {
        self.0.channel.push(CmEvent {
            status,
            ..CmEvent::new(kind, self.clone())
        });
    }

    fn upgrade(weak: &Option<Weak<IdInner>>) -> Option<SimId> {
        weak.as_ref().and_then(Weak::upgrade).map(SimId)
    }

    /// Tear the connection down on this side, then on the peer's.
    fn disconnect(&self, notify_self: bool) {
        let (qp, peer) = {
            let mut state = self.state();
            if !state.connected {
                return;
            }
            state.connected = false;
            (state.qp.clone(), Self::upgrade(&state.peer))
        };
        if let Some(qp) = qp {
            qp.set_error();
        }
        if notify_self {
            self.event(CmEventKind::Disconnected);
        }

        let Some(peer) = peer else { return };
        let qp = {
            let mut state = peer.state();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.qp.clone()
        };
        if let Some(qp) = qp {
            qp.set_error();
        }
        peer.event(CmEventKind::Disconnected);
    }
}

impl PartialEq for SimId {
    fn eq(&self, other: &Self) -> bool {
        self.0.handle == other.0.handle
    }
}

impl Eq for SimId {}

impl Hash for SimId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.handle.hash(state);
    }
}

impl std::fmt::Debug for SimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimId(#{})", self.0.handle)
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

fn loopback_of(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

impl Cm for SimProvider {
    type EventChannel = SimEventChannel;
    type Id = SimId;
    type EventRecord = SimEventRecord;

    fn create_event_channel(&self) -> io::Result<SimEventChannel> {
        Ok(SimEventChannel::default())
    }

    fn destroy_event_channel(&self, _channel: SimEventChannel) {}

    fn create_id(&self, channel: &SimEventChannel) -> io::Result<SimId> {
        Ok(SimId::new(&self.fabric, channel.clone()))
    }

    fn destroy_id(&self, id: &SimId) -> io::Result<()> {
        let listening = {
            let mut state = id.state();
            if state.destroyed {
                return Err(einval());
            }
            if state.qp.is_some() {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            state.destroyed = true;
            state.backlog.take().and(state.local)
        };
        if let Some(addr) = listening {
            self.fabric.remove_listener(addr, id.0.handle);
        }
        id.disconnect(false);
        self.fabric.released(Release::Id(id.0.handle));
        Ok(())
    }

    fn resolve_addr(&self, id: &SimId, dst: SocketAddr, _timeout: Duration) -> io::Result<()> {
        if dst.port() == 0 || dst.ip().is_unspecified() {
            id.event_with_status(CmEventKind::AddressError, -libc::ENETUNREACH);
            return Ok(());
        }

        let port = self.fabric.ephemeral_port();
        {
            let mut state = id.state();
            if state.destroyed || state.backlog.is_some() {
                return Err(einval());
            }
            state.local = Some(SocketAddr::new(loopback_of(&dst), port));
            state.remote = Some(dst);
            state.device = Some(self.fabric.device.clone());
        }
        id.event(CmEventKind::AddressResolved);
        Ok(())
    }

    fn resolve_route(&self, id: &SimId, _timeout: Duration) -> io::Result<()> {
        {
            let mut state = id.state();
            if state.remote.is_none() {
                return Err(einval());
            }
            state.route_resolved = true;
        }
        id.event(CmEventKind::RouteResolved);
        Ok(())
    }

    fn bind_addr(&self, id: &SimId, addr: SocketAddr) -> io::Result<()> {
        let addr = match addr.port() {
            0 => SocketAddr::new(addr.ip(), self.fabric.ephemeral_port()),
            _ => addr,
        };
        let mut state = id.state();
        if state.local.is_some() {
            return Err(einval());
        }
        state.local = Some(addr);
        state.device = (!addr.ip().is_unspecified()).then(|| self.fabric.device.clone());
        Ok(())
    }

    fn listen(&self, id: &SimId, backlog: i32) -> io::Result<()> {
        let local = {
            let mut state = id.state();
            let local = state.local.ok_or_else(einval)?;
            state.backlog = Some(Backlog {
                max: backlog.max(1) as usize,
                pending: 0,
            });
            local
        };
        self.fabric.add_listener(local, Arc::downgrade(&id.0))
    }

    fn connect(&self, id: &SimId, _param: &ConnParam) -> io::Result<()> {
        let (local, remote) = {
            let state = id.state();
            if !state.route_resolved || state.qp.is_none() || state.peer.is_some() {
                return Err(einval());
            }
            (state.local, state.remote.ok_or_else(einval)?)
        };

        let Some(listener) = self.fabric.listener(remote) else {
            id.event_with_status(CmEventKind::Rejected, -libc::ECONNREFUSED);
            return Ok(());
        };
        let queued = {
            let mut state = listener.state();
            let local = state.local;
            match state.backlog.as_mut() {
                Some(backlog) if backlog.pending < backlog.max => {
                    backlog.pending += 1;
                    Some(local)
                }
                _ => None,
            }
        };
        let Some(listen_addr) = queued else {
            id.event_with_status(CmEventKind::Rejected, -libc::ECONNREFUSED);
            return Ok(());
        };

        let child = SimId::new(&self.fabric, listener.0.channel.clone());
        {
            let mut state = child.state();
            state.local = listen_addr
                .filter(|addr| !addr.ip().is_unspecified())
                .or(Some(remote));
            state.remote = local;
            state.device = Some(self.fabric.device.clone());
            state.peer = Some(Arc::downgrade(&id.0));
            state.listener = Some(Arc::downgrade(&listener.0));
        }
        id.state().peer = Some(Arc::downgrade(&child.0));

        listener.0.channel.push(CmEvent {
            listen_id: Some(listener.clone()),
            ..CmEvent::new(CmEventKind::ConnectRequest, child)
        });
        Ok(())
    }

    fn accept(&self, id: &SimId, _param: &ConnParam) -> io::Result<()> {
        let (qp, peer, listener) = {
            let mut state = id.state();
            if state.accepted || state.peer.is_none() {
                return Err(einval());
            }
            let qp = state.qp.clone().ok_or_else(einval)?;
            state.accepted = true;
            state.connected = true;
            (qp, SimId::upgrade(&state.peer), SimId::upgrade(&state.listener))
        };
        if let Some(listener) = listener {
            if let Some(backlog) = listener.state().backlog.as_mut() {
                backlog.pending = backlog.pending.saturating_sub(1);
            }
        }

        let peer_qp = peer.as_ref().and_then(|peer| {
            let mut state = peer.state();
            state.connected = !state.destroyed;
            state.qp.clone().filter(|_| state.connected)
        });
        let (Some(peer), Some(peer_qp)) = (peer, peer_qp) else {
            log::debug!("initiator of {:?} went away before accept", id);
            id.disconnect(true);
            return Ok(());
        };

        qp.connect(&peer_qp);
        peer_qp.connect(&qp);
        id.event(CmEventKind::Established);
        peer.event(CmEventKind::Established);
        Ok(())
    }

    fn disconnect(&self, id: &SimId) -> io::Result<()> {
        id.disconnect(true);
        Ok(())
    }

    fn create_qp(&self, id: &SimId, pd: &SimPd, cq: &SimCq, caps: &QpCaps) -> io::Result<SimQp> {
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(einval());
        }
        let mut state = id.state();
        if state.device.as_ref() != Some(&pd.device) {
            return Err(einval());
        }
        if state.qp.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        let qp = SimQp::new(id.0.handle, cq.clone(), *caps, self.fabric.clone());
        state.qp = Some(qp.clone());
        Ok(qp)
    }

    fn destroy_qp(&self, id: &SimId, qp: SimQp) {
        qp.destroy();
        id.state().qp = None;
        self.fabric.released(Release::Qp(id.0.handle));
    }

    fn get_cm_event(&self, channel: &SimEventChannel) -> io::Result<SimEventRecord> {
        let event = channel.pop();
        self.fabric.unacked.fetch_add(1, Ordering::AcqRel);
        Ok(SimEventRecord(event))
    }

    fn event_payload(&self, record: &SimEventRecord) -> CmEvent<SimId> {
        record.0.clone()
    }

    fn ack_cm_event(&self, record: SimEventRecord) -> io::Result<()> {
        drop(record);
        self.fabric.unacked.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn device(&self, id: &SimId) -> Option<SimDevice> {
        id.state().device.clone()
    }

    fn local_addr(&self, id: &SimId) -> Option<SocketAddr> {
        id.state().local
    }

    fn peer_addr(&self, id: &SimId) -> Option<SocketAddr> {
        id.state().remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Verbs;

    fn next(provider: &SimProvider, channel: &SimEventChannel) -> CmEvent<SimId> {
        let record = provider.get_cm_event(channel).unwrap();
        let event = provider.event_payload(&record);
        provider.ack_cm_event(record).unwrap();
        event
    }

    fn qp_for(provider: &SimProvider, id: &SimId) -> SimQp {
        let dev = provider.device(id).unwrap();
        let pd = provider.alloc_pd(&dev).unwrap();
        let channel = provider.create_comp_channel(&dev).unwrap();
        let cq = provider.create_cq(&dev, 10, &channel).unwrap();
        provider.create_qp(id, &pd, &cq, &QpCaps::default()).unwrap()
    }

    #[test]
    fn handshake_and_teardown() {
        let provider = SimProvider::new();
        let addr: SocketAddr = "127.0.0.1:7471".parse().unwrap();

        let server_ch = provider.create_event_channel().unwrap();
        let listener = provider.create_id(&server_ch).unwrap();
        provider.bind_addr(&listener, addr).unwrap();
        provider.listen(&listener, 1).unwrap();

        let client_ch = provider.create_event_channel().unwrap();
        let client = provider.create_id(&client_ch).unwrap();
        let timeout = Duration::from_millis(500);
        provider.resolve_addr(&client, addr, timeout).unwrap();
        assert_eq!(next(&provider, &client_ch).kind, CmEventKind::AddressResolved);
        assert_eq!(provider.device(&client), Some(provider.default_device()));

        provider.resolve_route(&client, timeout).unwrap();
        assert_eq!(next(&provider, &client_ch).kind, CmEventKind::RouteResolved);

        let client_qp = qp_for(&provider, &client);
        provider.connect(&client, &ConnParam::default()).unwrap();
        let request = next(&provider, &server_ch);
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        assert_eq!(request.listen_id.as_ref(), Some(&listener));
        assert_ne!(request.id, listener);
        assert_eq!(provider.peer_addr(&request.id), provider.local_addr(&client));

        let server_qp = qp_for(&provider, &request.id);
        provider.accept(&request.id, &ConnParam::default()).unwrap();
        assert_eq!(next(&provider, &server_ch).kind, CmEventKind::Established);
        assert_eq!(next(&provider, &client_ch).kind, CmEventKind::Established);

        provider.disconnect(&client).unwrap();
        assert_eq!(next(&provider, &client_ch).kind, CmEventKind::Disconnected);
        let event = next(&provider, &server_ch);
        assert_eq!(event.kind, CmEventKind::Disconnected);
        assert_eq!(event.id, request.id);

        // The QP must go first.
        assert_eq!(
            provider.destroy_id(&client).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
        provider.destroy_qp(&client, client_qp);
        provider.destroy_qp(&request.id, server_qp);
        provider.destroy_id(&client).unwrap();
        provider.destroy_id(&request.id).unwrap();
        assert_eq!(provider.unacked_events(), 0);
    }

    #[test]
    fn connect_without_listener_is_rejected() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let client = provider.create_id(&channel).unwrap();
        let timeout = Duration::from_millis(500);

        provider
            .resolve_addr(&client, "127.0.0.1:1".parse().unwrap(), timeout)
            .unwrap();
        next(&provider, &channel);
        provider.resolve_route(&client, timeout).unwrap();
        next(&provider, &channel);
        let _qp = qp_for(&provider, &client);
        provider.connect(&client, &ConnParam::default()).unwrap();

        let event = next(&provider, &channel);
        assert_eq!(event.kind, CmEventKind::Rejected);
        assert_eq!(event.status, -libc::ECONNREFUSED);
    }

    #[test]
    fn unresolvable_address() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let client = provider.create_id(&channel).unwrap();
        provider
            .resolve_addr(&client, "0.0.0.0:20079".parse().unwrap(), Duration::from_millis(500))
            .unwrap();
        assert_eq!(next(&provider, &channel).kind, CmEventKind::AddressError);
    }

    #[test]
    fn listen_address_in_use() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let addr: SocketAddr = "127.0.0.1:7472".parse().unwrap();

        let first = provider.create_id(&channel).unwrap();
        provider.bind_addr(&first, addr).unwrap();
        provider.listen(&first, 10).unwrap();

        let second = provider.create_id(&channel).unwrap();
        provider.bind_addr(&second, addr).unwrap();
        assert_eq!(
            provider.listen(&second, 10).unwrap_err().raw_os_error(),
            Some(libc::EADDRINUSE)
        );

        provider.destroy_id(&first).unwrap();
        provider.listen(&second, 10).unwrap();
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use super::{CmEvent, CmEventKind, ConnParam, Flow};
use crate::context::TransportSlot;
use crate::echo::{message, ServerStats};
use crate::error::{Error, ProviderResultExt, Result};
use crate::peer::PeerConnection;
use crate::poller::CompletionHandler;
use crate::provider::{Cm, Verbs};

/// Phases of one accepted connection. A closed connection is no longer
/// tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerConnState {
    Accepting,
    Established,
    /// Left in place if the teardown fails.
    Disconnecting,
}

struct ServerConn<P: Cm> {
    conn: Arc<PeerConnection<P>>,
    state: ServerConnState,
}

/// Drives the listening side. Every accepted endpoint is tracked on its
/// own; the listening endpoint itself stays listening.
pub struct ServerMachine<P: Cm> {
    slot: Arc<TransportSlot<P>>,
    handler: Arc<dyn CompletionHandler<P>>,
    param: ConnParam,
    conns: HashMap<P::Id, ServerConn<P>>,
    stats: Arc<ServerStats>,
}

impl<P: Cm> ServerMachine<P> {
    pub fn new(
        slot: Arc<TransportSlot<P>>,
        handler: Arc<dyn CompletionHandler<P>>,
        param: ConnParam,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            slot,
            handler,
            param,
            conns: HashMap::new(),
            stats,
        }
    }

    /// State of the connection on endpoint `id`, if it is tracked.
    pub fn state_of(&self, id: &P::Id) -> Option<ServerConnState> {
        self.conns.get(id).map(|c| c.state)
    }

    pub fn handle(&mut self, event: CmEvent<P::Id>) -> Result<Flow> {
        let provider = self.slot.provider();
        match event.kind {
            CmEventKind::ConnectRequest => {
                let peer = provider.peer_addr(&event.id);
                let dev = provider.device(&event.id);
                log::info!(
                    "connect request from {:?} on device {}",
                    peer,
                    dev.map_or_else(|| "<none>".to_owned(), |d| provider.device_name(&d))
                );

                let conn = PeerConnection::initialize(&self.slot, event.id.clone(), &self.handler)?;
                self.conns.insert(
                    event.id.clone(),
                    ServerConn {
                        conn,
                        state: ServerConnState::Accepting,
                    },
                );
                provider
                    .accept(&event.id, &self.param)
                    .during("rdma_accept")?;
                self.stats.on_accept();
            }
            CmEventKind::Established => {
                let entry = self.conns.get_mut(&event.id).ok_or(Error::UnknownEndpoint)?;
                entry.state = ServerConnState::Established;
                let (send, recv) = entry.conn.with_buffers(|bufs| {
                    (
                        message::text(bufs.send).into_owned(),
                        message::text(bufs.recv).into_owned(),
                    )
                })?;
                log::info!(
                    "connection {} established with {:?} (send buffer {:?}, recv buffer {:?})",
                    entry.conn.id(),
                    entry.conn.peer_addr(),
                    send,
                    recv
                );
            }
            CmEventKind::Disconnected => {
                let entry = self.conns.get_mut(&event.id).ok_or(Error::UnknownEndpoint)?;
                entry.state = ServerConnState::Disconnecting;
                log::info!("connection {} with {:?} disconnected", entry.conn.id(), entry.conn.peer_addr());
                entry.conn.destroy()?;
                self.conns.remove(&event.id);
                self.stats.on_close();
            }
            kind => {
                log::error!("unexpected CM event {:?} (status {})", kind, event.status);
                return Err(Error::UnexpectedEvent {
                    event: kind,
                    state: "listening",
                });
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::*;
    use crate::poller::tests::Recorder;
    use crate::provider::sim::{SimEventChannel, SimId, SimProvider};
    use crate::rdma::qp::QpCaps;

    fn next(provider: &SimProvider, channel: &SimEventChannel) -> CmEvent<SimId> {
        let record = provider.get_cm_event(channel).unwrap();
        let event = provider.event_payload(&record);
        provider.ack_cm_event(record).unwrap();
        event
    }

    fn machine(provider: &SimProvider) -> ServerMachine<SimProvider> {
        let slot = Arc::new(TransportSlot::new(provider.clone(), 10, QpCaps::default()));
        ServerMachine::new(
            slot,
            Recorder::handler(),
            ConnParam::default(),
            Arc::new(ServerStats::default()),
        )
    }

    #[test]
    fn unknown_endpoint() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let id = provider.create_id(&channel).unwrap();
        let mut machine = machine(&provider);

        for kind in [CmEventKind::Established, CmEventKind::Disconnected] {
            let event = CmEvent::new(kind, id.clone());
            assert!(matches!(machine.handle(event), Err(Error::UnknownEndpoint)));
        }
        assert_eq!(machine.state_of(&id), None);
    }

    #[test]
    fn unexpected_event() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let id = provider.create_id(&channel).unwrap();
        let mut machine = machine(&provider);

        let event = CmEvent::new(CmEventKind::RouteResolved, id);
        assert!(matches!(
            machine.handle(event),
            Err(Error::UnexpectedEvent {
                event: CmEventKind::RouteResolved,
                state: "listening"
            })
        ));
    }

    #[test]
    fn connect_request_on_unbound_endpoint() {
        let provider = SimProvider::new();
        let channel = provider.create_event_channel().unwrap();
        let id = provider.create_id(&channel).unwrap();
        let mut machine = machine(&provider);

        let event = CmEvent::new(CmEventKind::ConnectRequest, id.clone());
        assert!(matches!(machine.handle(event), Err(Error::NoDevice)));
        assert_eq!(machine.state_of(&id), None);
    }

    #[test]
    fn connection_lifecycle() {
        let provider = SimProvider::new();
        let addr: SocketAddr = "127.0.0.1:7480".parse().unwrap();
        let server_ch = provider.create_event_channel().unwrap();
        let listener = provider.create_id(&server_ch).unwrap();
        provider.bind_addr(&listener, addr).unwrap();
        provider.listen(&listener, 10).unwrap();
        let mut machine = machine(&provider);

        let client_ch = provider.create_event_channel().unwrap();
        let client = provider.create_id(&client_ch).unwrap();
        let timeout = Duration::from_millis(500);
        provider.resolve_addr(&client, addr, timeout).unwrap();
        next(&provider, &client_ch);
        provider.resolve_route(&client, timeout).unwrap();
        next(&provider, &client_ch);
        let dev = provider.device(&client).unwrap();
        let pd = provider.alloc_pd(&dev).unwrap();
        let comp = provider.create_comp_channel(&dev).unwrap();
        let cq = provider.create_cq(&dev, 10, &comp).unwrap();
        let client_qp = provider
            .create_qp(&client, &pd, &cq, &QpCaps::default())
            .unwrap();
        provider.connect(&client, &ConnParam::default()).unwrap();

        let request = next(&provider, &server_ch);
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        let id = request.id.clone();
        machine.handle(request).unwrap();
        assert_eq!(machine.state_of(&id), Some(ServerConnState::Accepting));

        let established = next(&provider, &server_ch);
        assert_eq!(established.kind, CmEventKind::Established);
        machine.handle(established).unwrap();
        assert_eq!(machine.state_of(&id), Some(ServerConnState::Established));
        assert_eq!(machine.state_of(&listener), None);

        provider.disconnect(&client).unwrap();
        let disconnected = next(&provider, &server_ch);
        assert_eq!(disconnected.kind, CmEventKind::Disconnected);
        machine.handle(disconnected).unwrap();
        assert_eq!(machine.state_of(&id), None);
        assert_eq!(machine.stats.accepted(), 1);
        assert_eq!(machine.stats.closed(), 1);

        provider.destroy_qp(&client, client_qp);
        provider.destroy_id(&client).unwrap();
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use super::{CmEvent, CmEventKind, ConnParam, Flow};
use crate::context::TransportSlot;
use crate::error::{Error, ProviderResultExt, Result};
use crate::peer::PeerConnection;
use crate::poller::CompletionHandler;
use crate::provider::{Cm, Verbs};

/// Phases of the initiating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    AddressResolving,
    AddressResolved,
    RouteResolving,
    RouteResolved,
    Connecting,
    Established,
    Disconnecting,
    Closed,
}

impl ClientState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::AddressResolving => "address resolving",
            Self::AddressResolved => "address resolved",
            Self::RouteResolving => "route resolving",
            Self::RouteResolved => "route resolved",
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        }
    }
}

/// Drives one initiating endpoint from address resolution to teardown.
///
/// Once established, the connection is handed to the session over
/// `established`; the session ends it with a disconnect, whose event makes
/// this machine destroy the connection and stop.
pub struct ClientMachine<P: Cm> {
    slot: Arc<TransportSlot<P>>,
    handler: Arc<dyn CompletionHandler<P>>,
    param: ConnParam,
    timeout: Duration,
    state: ClientState,
    conn: Option<Arc<PeerConnection<P>>>,
    established: Sender<Arc<PeerConnection<P>>>,
    local_close: Arc<AtomicBool>,
}

impl<P: Cm> ClientMachine<P> {
    pub fn new(
        slot: Arc<TransportSlot<P>>,
        handler: Arc<dyn CompletionHandler<P>>,
        param: ConnParam,
        timeout: Duration,
        established: Sender<Arc<PeerConnection<P>>>,
    ) -> Self {
        Self {
            slot,
            handler,
            param,
            timeout,
            state: ClientState::Init,
            conn: None,
            established,
            local_close: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Flag the session raises before it disconnects.
    pub fn local_close(&self) -> Arc<AtomicBool> {
        self.local_close.clone()
    }

    /// Start resolving `server` on `id`.
    pub fn start(&mut self, id: &P::Id, server: SocketAddr) -> Result<()> {
        if self.state != ClientState::Init {
            return Err(Error::UnexpectedEvent {
                event: CmEventKind::AddressResolved,
                state: self.state.name(),
            });
        }
        self.slot
            .provider()
            .resolve_addr(id, server, self.timeout)
            .during("rdma_resolve_addr")?;
        self.state = ClientState::AddressResolving;
        Ok(())
    }

    pub fn handle(&mut self, event: CmEvent<P::Id>) -> Result<Flow> {
        let provider = self.slot.provider();
        match (self.state, event.kind) {
            (ClientState::AddressResolving, CmEventKind::AddressResolved) => {
                self.state = ClientState::AddressResolved;
                if let Some(dev) = provider.device(&event.id) {
                    log::info!("address resolved on device {}", provider.device_name(&dev));
                }
                if self.conn.is_none() {
                    self.conn = Some(PeerConnection::initialize(
                        &self.slot,
                        event.id.clone(),
                        &self.handler,
                    )?);
                }
                provider
                    .resolve_route(&event.id, self.timeout)
                    .during("rdma_resolve_route")?;
                self.state = ClientState::RouteResolving;
            }
            (ClientState::RouteResolving, CmEventKind::RouteResolved) => {
                self.state = ClientState::RouteResolved;
                log::info!("route resolved");
                provider
                    .connect(&event.id, &self.param)
                    .during("rdma_connect")?;
                self.state = ClientState::Connecting;
            }
            (ClientState::Connecting, CmEventKind::Established) => {
                self.state = ClientState::Established;
                let conn = self.conn.clone().ok_or(Error::UnknownEndpoint)?;
                log::info!("connected to {:?}", conn.peer_addr());
                if self.established.send(conn).is_err() {
                    log::warn!("client session is gone");
                }
            }
            (ClientState::Established, CmEventKind::Disconnected) => {
                self.state = ClientState::Disconnecting;
                let side = match self.local_close.load(Ordering::Acquire) {
                    true => "local",
                    false => "remote",
                };
                log::info!("disconnected ({} close)", side);
                if let Some(conn) = self.conn.take() {
                    conn.destroy()?;
                }
                self.state = ClientState::Closed;
                return Ok(Flow::Stop);
            }
            (state, kind) => {
                log::error!("unexpected CM event {:?} (status {}) in state {}", kind, event.status, state.name());
                return Err(Error::UnexpectedEvent {
                    event: kind,
                    state: state.name(),
                });
            }
        }
        Ok(Flow::Continue)
    }
}

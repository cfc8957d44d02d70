use std::net::SocketAddr;
use std::sync::Arc;

use crate::cm::{self, ServerMachine};
use crate::config::EchoConfig;
use crate::context::TransportSlot;
use crate::echo::{ServerHandler, ServerStats};
use crate::error::{ProviderResultExt, Result};
use crate::poller::CompletionHandler;
use crate::provider::Cm;

/// The listening side of the echo service.
pub struct EchoServer<P: Cm> {
    provider: P,
    channel: P::EventChannel,
    listener: P::Id,
    machine: ServerMachine<P>,
    stats: Arc<ServerStats>,
}

impl<P: Cm> EchoServer<P> {
    /// Bind to `addr` and start listening.
    pub fn bind(provider: P, config: &EchoConfig, addr: SocketAddr) -> Result<Self> {
        let channel = provider
            .create_event_channel()
            .during("rdma_create_event_channel")?;
        let listener = provider.create_id(&channel).during("rdma_create_id")?;
        provider.bind_addr(&listener, addr).during("rdma_bind_addr")?;
        provider
            .listen(&listener, config.backlog)
            .during("rdma_listen")?;

        match provider.local_addr(&listener) {
            Some(local) => log::info!("listening on {}", local),
            None => log::info!("listening on {}", addr),
        }

        let stats = Arc::new(ServerStats::default());
        let handler: Arc<dyn CompletionHandler<P>> = Arc::new(ServerHandler::new(stats.clone()));
        let slot = Arc::new(TransportSlot::new(
            provider.clone(),
            config.cq_depth,
            config.qp,
        ));
        let machine = ServerMachine::new(slot, handler, config.conn, stats.clone());
        Ok(Self {
            provider,
            channel,
            listener,
            machine,
            stats,
        })
    }

    /// The address actually listened on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.provider.local_addr(&self.listener)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Serve connections until an error occurs.
    pub fn serve(mut self) -> Result<()> {
        let machine = &mut self.machine;
        cm::event_loop(&self.provider, &self.channel, |event| machine.handle(event))
    }
}

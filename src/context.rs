use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::error::{Error, ProviderResultExt, Result};
use crate::peer::{ConnId, PeerConnection};
use crate::poller::{self, CompletionHandler};
use crate::provider::{Cm, Verbs};
use crate::rdma::qp::QpCaps;

/// Resources shared by every connection on one device: a protection domain,
/// one completion queue, and the channel it notifies.
///
/// Built once per [`TransportSlot`] and never torn down.
pub struct TransportContext<P: Cm> {
    provider: P,
    device: P::Device,
    pub(crate) pd: P::Pd,
    pub(crate) channel: P::CompChannel,
    pub(crate) cq: P::Cq,
    conns: RwLock<HashMap<ConnId, Arc<PeerConnection<P>>>>,
    next_id: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Cm> TransportContext<P> {
    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[inline]
    pub fn device(&self) -> &P::Device {
        &self.device
    }

    /// Whether the completion poller thread is alive.
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, conn: Arc<PeerConnection<P>>) {
        self.conns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.id(), conn);
    }

    pub(crate) fn unregister(&self, id: ConnId) -> Option<Arc<PeerConnection<P>>> {
        self.conns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Find a live connection by identity.
    pub fn lookup(&self, id: ConnId) -> Option<Arc<PeerConnection<P>>> {
        self.conns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.conns.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Lazily builds the [`TransportContext`] of one role.
///
/// The first [`get_or_create`](TransportSlot::get_or_create) builds the
/// context and starts its completion poller; concurrent first callers are
/// serialized so only one of them allocates.
pub struct TransportSlot<P: Cm> {
    provider: P,
    cq_depth: u32,
    caps: QpCaps,
    ctx: Mutex<Option<Arc<TransportContext<P>>>>,
}

impl<P: Cm> TransportSlot<P> {
    pub fn new(provider: P, cq_depth: u32, caps: QpCaps) -> Self {
        Self {
            provider,
            cq_depth,
            caps,
            ctx: Mutex::new(None),
        }
    }

    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Capabilities of queue pairs created on this slot's context.
    #[inline]
    pub fn qp_caps(&self) -> &QpCaps {
        &self.caps
    }

    /// The context, if it has been built.
    pub fn get(&self) -> Option<Arc<TransportContext<P>>> {
        self.ctx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Get the context bound to `device`, building it on first use with
    /// `handler` receiving its completions.
    ///
    /// Asking for a device other than the bound one is an error.
    pub fn get_or_create(
        &self,
        device: &P::Device,
        handler: &Arc<dyn CompletionHandler<P>>,
    ) -> Result<Arc<TransportContext<P>>> {
        let mut slot = self.ctx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ctx) = slot.as_ref() {
            if ctx.device != *device {
                return Err(Error::DeviceMismatch {
                    bound: self.provider.device_name(&ctx.device),
                    requested: self.provider.device_name(device),
                });
            }
            return Ok(ctx.clone());
        }

        let provider = &self.provider;
        let pd = provider.alloc_pd(device).during("ibv_alloc_pd")?;
        let channel = provider
            .create_comp_channel(device)
            .during("ibv_create_comp_channel")?;
        let cq = provider
            .create_cq(device, self.cq_depth, &channel)
            .during("ibv_create_cq")?;
        provider.req_notify_cq(&cq).during("ibv_req_notify_cq")?;

        let ctx = Arc::new(TransportContext {
            provider: provider.clone(),
            device: device.clone(),
            pd,
            channel,
            cq,
            conns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            poller: Mutex::new(None),
        });
        let handle = poller::spawn(ctx.clone(), handler.clone()).during("spawn completion poller")?;
        *ctx.poller.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!(
            "transport context ready on device {} (cq depth {})",
            provider.device_name(device),
            self.cq_depth
        );
        *slot = Some(ctx.clone());
        Ok(ctx)
    }
}

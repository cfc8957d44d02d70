//! The transport capabilities the echo core consumes.
//!
//! [`Verbs`] covers device resources and the data path, [`Cm`] covers the
//! connection manager. Every call maps onto one `libibverbs` or `librdmacm`
//! function, and failures are reported as [`std::io::Error`]s the way the
//! C interfaces report `errno`.
//!
//! Two providers are shipped:
//!
//! - [`sim::SimProvider`], an in-process fabric that needs no hardware;
//! - `verbs::VerbsProvider` (feature `verbs`), backed by rdma-core.

use std::fmt;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::cm::{CmEvent, ConnParam};
use crate::rdma::{
    cq::Wc,
    mr::{MemoryRegion, Permission},
    qp::QpCaps,
    wr::{RecvWr, SendWr},
};

pub mod sim;

#[cfg(feature = "verbs")]
pub mod verbs;

/// Device resources and the data path.
pub trait Verbs: Clone + Send + Sync + 'static {
    /// An opened RDMA device.
    type Device: Clone + Eq + fmt::Debug + Send + Sync + 'static;

    /// Protection domain.
    type Pd: Send + Sync + 'static;

    /// Completion event channel.
    type CompChannel: Send + Sync + 'static;

    /// Completion queue.
    type Cq: Send + Sync + 'static;

    /// Reliable-connected queue pair.
    type Qp: Send + Sync + 'static;

    /// Registered memory region.
    type Mr: MemoryRegion;

    /// Human-readable device name.
    fn device_name(&self, dev: &Self::Device) -> String;

    fn alloc_pd(&self, dev: &Self::Device) -> io::Result<Self::Pd>;

    fn create_comp_channel(&self, dev: &Self::Device) -> io::Result<Self::CompChannel>;

    /// Create a completion queue of `depth` entries reporting to `channel`.
    fn create_cq(
        &self,
        dev: &Self::Device,
        depth: u32,
        channel: &Self::CompChannel,
    ) -> io::Result<Self::Cq>;

    /// Arm the CQ: the next completion added to it wakes the channel once.
    fn req_notify_cq(&self, cq: &Self::Cq) -> io::Result<()>;

    /// Block until the channel reports a completion event.
    fn get_cq_event(&self, channel: &Self::CompChannel) -> io::Result<()>;

    /// Acknowledge `n` events got from the channel.
    fn ack_cq_events(&self, cq: &Self::Cq, n: u32);

    /// Poll one ready completion, if any.
    fn poll_cq(&self, cq: &Self::Cq) -> io::Result<Option<Wc>>;

    /// Register `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The memory must stay valid until the region is passed to
    /// [`Verbs::dereg_mr`].
    unsafe fn reg_mr(
        &self,
        pd: &Self::Pd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Self::Mr>;

    fn dereg_mr(&self, mr: Self::Mr) -> io::Result<()>;

    fn post_send(&self, qp: &Self::Qp, wr: &SendWr) -> io::Result<()>;

    fn post_recv(&self, qp: &Self::Qp, wr: &RecvWr) -> io::Result<()>;
}

/// Connection manager.
///
/// Calls that complete asynchronously (`resolve_addr`, `resolve_route`,
/// `connect`, `accept`, `disconnect`) report their outcome as a
/// [`CmEvent`] on the event channel the endpoint was created on.
pub trait Cm: Verbs {
    /// Event channel.
    type EventChannel: Send + Sync + 'static;

    /// Connection endpoint. Clones refer to the same endpoint.
    type Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// A provider-owned event record, to be returned by [`Cm::ack_cm_event`].
    type EventRecord;

    fn create_event_channel(&self) -> io::Result<Self::EventChannel>;

    fn destroy_event_channel(&self, channel: Self::EventChannel);

    fn create_id(&self, channel: &Self::EventChannel) -> io::Result<Self::Id>;

    fn destroy_id(&self, id: &Self::Id) -> io::Result<()>;

    fn resolve_addr(&self, id: &Self::Id, dst: SocketAddr, timeout: Duration) -> io::Result<()>;

    fn resolve_route(&self, id: &Self::Id, timeout: Duration) -> io::Result<()>;

    fn bind_addr(&self, id: &Self::Id, addr: SocketAddr) -> io::Result<()>;

    fn listen(&self, id: &Self::Id, backlog: i32) -> io::Result<()>;

    fn connect(&self, id: &Self::Id, param: &ConnParam) -> io::Result<()>;

    fn accept(&self, id: &Self::Id, param: &ConnParam) -> io::Result<()>;

    fn disconnect(&self, id: &Self::Id) -> io::Result<()>;

    /// Create an RC queue pair on `id`, both sub-queues reporting to `cq`.
    fn create_qp(
        &self,
        id: &Self::Id,
        pd: &Self::Pd,
        cq: &Self::Cq,
        caps: &QpCaps,
    ) -> io::Result<Self::Qp>;

    fn destroy_qp(&self, id: &Self::Id, qp: Self::Qp);

    /// Block until the next event arrives on `channel`.
    fn get_cm_event(&self, channel: &Self::EventChannel) -> io::Result<Self::EventRecord>;

    /// Copy the payload out of an event record.
    fn event_payload(&self, record: &Self::EventRecord) -> CmEvent<Self::Id>;

    fn ack_cm_event(&self, record: Self::EventRecord) -> io::Result<()>;

    /// The device `id` is bound to, if any.
    fn device(&self, id: &Self::Id) -> Option<Self::Device>;

    fn local_addr(&self, id: &Self::Id) -> Option<SocketAddr>;

    fn peer_addr(&self, id: &Self::Id) -> Option<SocketAddr>;
}

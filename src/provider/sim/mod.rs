//! An in-process RDMA fabric.
//!
//! [`SimProvider`] implements [`Verbs`] and [`Cm`] without hardware: all
//! endpoints created from clones of one provider live on the same fabric
//! and can connect to each other by socket address. It keeps the provider
//! behaviours the echo core relies on:
//!
//! - CM calls complete asynchronously, as events on the endpoint's channel;
//! - an armed CQ wakes its completion channel once;
//! - completions are polled in the order they were produced;
//! - scatter/gather entries are checked against registered memory regions;
//! - receive queues are bounded by [`QpCaps::max_recv_wr`];
//! - disconnecting flushes outstanding receives with
//!   [`WcStatus::WrFlushErr`](crate::rdma::cq::WcStatus::WrFlushErr).
//!
//! Every queue pair, memory region and endpoint released is recorded, in
//! order, in [`SimProvider::releases`].

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::Verbs;
use crate::rdma::{
    cq::Wc,
    mr::{MemoryRegion, Permission},
    type_alias::{LKey, RKey},
    wr::{RecvWr, SendWr, Sge},
};

mod cm;
mod cq;
mod qp;

pub use self::cm::{SimEventChannel, SimEventRecord, SimId};
pub use self::cq::{SimCompChannel, SimCq};
pub use self::qp::SimQp;

/// First port handed out to endpoints that do not bind one.
const EPHEMERAL_PORT_BASE: u16 = 49152;

/// A simulated RDMA device.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimDevice {
    name: Arc<str>,
}

impl SimDevice {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Simulated protection domain.
#[derive(Debug)]
pub struct SimPd {
    device: SimDevice,
}

/// Simulated memory region.
#[derive(Debug)]
pub struct SimMr {
    lkey: LKey,
    rkey: RKey,
}

impl MemoryRegion for SimMr {
    fn lkey(&self) -> LKey {
        self.lkey
    }

    fn rkey(&self) -> RKey {
        self.rkey
    }
}

/// A resource released through the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Queue pair of the endpoint with this handle.
    Qp(u64),
    Mr(LKey),
    /// Endpoint, by [`SimId::handle`].
    Id(u64),
}

#[derive(Clone, Copy)]
struct MrEntry {
    addr: u64,
    len: usize,
    perm: Permission,
}

impl MrEntry {
    fn covers(&self, sge: &Sge) -> bool {
        sge.addr >= self.addr && sge.addr + sge.length as u64 <= self.addr + self.len as u64
    }
}

#[derive(Default)]
struct FabricState {
    listeners: HashMap<SocketAddr, Weak<cm::IdInner>>,
    mrs: HashMap<LKey, MrEntry>,
    releases: Vec<Release>,
    next_key: u32,
    next_port: u16,
}

pub(crate) struct Fabric {
    state: Mutex<FabricState>,
    next_handle: AtomicU64,
    unacked: AtomicUsize,
    device: SimDevice,
}

impl Fabric {
    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn ephemeral_port(&self) -> u16 {
        let mut state = self.state();
        let port = EPHEMERAL_PORT_BASE.wrapping_add(state.next_port);
        state.next_port = (state.next_port + 1) % (u16::MAX - EPHEMERAL_PORT_BASE);
        port
    }

    fn add_listener(&self, addr: SocketAddr, id: Weak<cm::IdInner>) -> io::Result<()> {
        let mut state = self.state();
        if let Some(old) = state.listeners.get(&addr) {
            if old.strong_count() > 0 {
                return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
            }
        }
        state.listeners.insert(addr, id);
        Ok(())
    }

    fn remove_listener(&self, addr: SocketAddr, handle: u64) {
        let mut state = self.state();
        let owned = state
            .listeners
            .get(&addr)
            .and_then(Weak::upgrade)
            .map_or(true, |id| id.handle() == handle);
        if owned {
            state.listeners.remove(&addr);
        }
    }

    /// Find the listener serving `addr`, falling back to a wildcard bind.
    fn listener(&self, addr: SocketAddr) -> Option<SimId> {
        let wildcard = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let state = self.state();
        state
            .listeners
            .get(&addr)
            .or_else(|| state.listeners.get(&SocketAddr::new(wildcard, addr.port())))
            .and_then(Weak::upgrade)
            .map(SimId::from_inner)
    }

    fn register(&self, addr: u64, len: usize, perm: Permission) -> SimMr {
        let mut state = self.state();
        state.next_key += 1;
        let lkey = state.next_key;
        state.mrs.insert(lkey, MrEntry { addr, len, perm });
        SimMr { lkey, rkey: lkey }
    }

    fn deregister(&self, lkey: LKey) -> io::Result<()> {
        let mut state = self.state();
        match state.mrs.remove(&lkey) {
            Some(_) => {
                state.releases.push(Release::Mr(lkey));
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn released(&self, what: Release) {
        self.state().releases.push(what);
    }

    /// Gather the bytes `sge` refers to.
    fn read(&self, sge: &Sge) -> Option<Vec<u8>> {
        let state = self.state();
        state.mrs.get(&sge.lkey).filter(|mr| mr.covers(sge))?;
        // SAFETY: the range lies in a registered region, whose memory stays
        // valid until deregistration, which needs the lock we hold.
        let data = unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize) };
        Some(data.to_vec())
    }

    /// Scatter `data` into the memory `sge` refers to.
    fn write(&self, sge: &Sge, data: &[u8]) -> bool {
        let state = self.state();
        match state.mrs.get(&sge.lkey) {
            Some(mr) if mr.covers(sge) && mr.perm.contains(Permission::LOCAL_WRITE) => {
                // SAFETY: same as in `read`; the caller checked `data` fits.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), sge.addr as *mut u8, data.len())
                };
                true
            }
            _ => false,
        }
    }
}

/// The simulated provider.
///
/// Clones share the same fabric.
#[derive(Clone)]
pub struct SimProvider {
    fabric: Arc<Fabric>,
}

impl Default for SimProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimProvider {
    /// Create a new fabric with a single device named `sim0`.
    pub fn new() -> Self {
        Self::with_device(SimDevice::new("sim0"))
    }

    /// Create a new fabric whose endpoints bind to `device`.
    pub fn with_device(device: SimDevice) -> Self {
        Self {
            fabric: Arc::new(Fabric {
                state: Mutex::new(FabricState::default()),
                next_handle: AtomicU64::new(1),
                unacked: AtomicUsize::new(0),
                device,
            }),
        }
    }

    /// The device endpoints bind to.
    pub fn default_device(&self) -> SimDevice {
        self.fabric.device.clone()
    }

    /// Number of CM events retrieved but not yet acknowledged.
    pub fn unacked_events(&self) -> usize {
        self.fabric.unacked.load(Ordering::Acquire)
    }

    /// Number of registered memory regions.
    pub fn registered_mrs(&self) -> usize {
        self.fabric.state().mrs.len()
    }

    /// Resources released so far, oldest first.
    pub fn releases(&self) -> Vec<Release> {
        self.fabric.state().releases.clone()
    }
}

impl Verbs for SimProvider {
    type Device = SimDevice;
    type Pd = SimPd;
    type CompChannel = SimCompChannel;
    type Cq = SimCq;
    type Qp = SimQp;
    type Mr = SimMr;

    fn device_name(&self, dev: &SimDevice) -> String {
        dev.name().to_owned()
    }

    fn alloc_pd(&self, dev: &SimDevice) -> io::Result<SimPd> {
        Ok(SimPd {
            device: dev.clone(),
        })
    }

    fn create_comp_channel(&self, _dev: &SimDevice) -> io::Result<SimCompChannel> {
        Ok(SimCompChannel::default())
    }

    fn create_cq(&self, _dev: &SimDevice, depth: u32, channel: &SimCompChannel) -> io::Result<SimCq> {
        if depth == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(SimCq::new(depth, channel))
    }

    fn req_notify_cq(&self, cq: &SimCq) -> io::Result<()> {
        cq.arm();
        Ok(())
    }

    fn get_cq_event(&self, channel: &SimCompChannel) -> io::Result<()> {
        channel.0.wait();
        Ok(())
    }

    fn ack_cq_events(&self, _cq: &SimCq, _n: u32) {}

    fn poll_cq(&self, cq: &SimCq) -> io::Result<Option<Wc>> {
        Ok(cq.pop())
    }

    unsafe fn reg_mr(
        &self,
        _pd: &SimPd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<SimMr> {
        if addr.is_null() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(self.fabric.register(addr as u64, len, perm))
    }

    fn dereg_mr(&self, mr: SimMr) -> io::Result<()> {
        self.fabric.deregister(mr.lkey)
    }

    fn post_send(&self, qp: &SimQp, wr: &SendWr) -> io::Result<()> {
        qp.post_send(wr)
    }

    fn post_recv(&self, qp: &SimQp, wr: &RecvWr) -> io::Result<()> {
        qp.post_recv(wr)
    }
}

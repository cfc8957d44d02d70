//! Hardware provider over `libibverbs` and `librdmacm`.
//!
//! Device resources are never released: the transport context that owns
//! them lives until the process exits. Queue pairs, memory regions and
//! endpoints are released explicitly through the [`Verbs`] and [`Cm`] calls.

mod addr;

use std::ffi::CStr;
use std::net::SocketAddr;
use std::ptr::{self, NonNull};
use std::time::Duration;
use std::{io, mem};

use super::{Cm, Verbs};
use crate::bindings::*;
use crate::cm::{CmEvent, CmEventKind, ConnParam};
use crate::rdma::{
    cq::{Wc, WcOpcode, WcStatus},
    mr::{MemoryRegion, Permission},
    qp::QpCaps,
    type_alias::{LKey, RKey},
    wr::{RecvWr, SendWr, Sge},
};
use crate::utils::interop::*;

/// Device context, opened by `librdmacm` when an endpoint binds.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct IbvContext(NonNull<ibv_context>);
impl_ibv_wrapper_traits!(ibv_context, IbvContext);

#[repr(transparent)]
pub struct IbvPd(NonNull<ibv_pd>);
impl_ibv_wrapper_traits!(ibv_pd, IbvPd);

#[repr(transparent)]
pub struct IbvCompChannel(NonNull<ibv_comp_channel>);
impl_ibv_wrapper_traits!(ibv_comp_channel, IbvCompChannel);

#[repr(transparent)]
pub struct IbvCq(NonNull<ibv_cq>);
impl_ibv_wrapper_traits!(ibv_cq, IbvCq);

#[repr(transparent)]
pub struct IbvQp(NonNull<ibv_qp>);
impl_ibv_wrapper_traits!(ibv_qp, IbvQp);

#[repr(transparent)]
pub struct IbvMr(NonNull<ibv_mr>);
impl_ibv_wrapper_traits!(ibv_mr, IbvMr);

impl MemoryRegion for IbvMr {
    fn lkey(&self) -> LKey {
        // SAFETY: the MR is valid until deregistered, which consumes `self`.
        unsafe { (*self.as_ptr()).lkey }
    }

    fn rkey(&self) -> RKey {
        // SAFETY: same as above.
        unsafe { (*self.as_ptr()).rkey }
    }
}

#[repr(transparent)]
pub struct RdmaEventChannel(NonNull<rdma_event_channel>);
impl_ibv_wrapper_traits!(rdma_event_channel, RdmaEventChannel);

/// Connection manager endpoint. Compares by address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RdmaCmId(NonNull<rdma_cm_id>);
impl_ibv_wrapper_traits!(rdma_cm_id, RdmaCmId);

#[repr(transparent)]
pub struct RdmaCmEvent(NonNull<rdma_cm_event>);
impl_ibv_wrapper_traits!(rdma_cm_event, RdmaCmEvent);

/// Turn a pointer returned by a C allocator into a wrapper, or the `errno`
/// it left behind.
fn from_c_ptr<T, W: From<NonNull<T>>>(ptr: *mut T) -> io::Result<W> {
    NonNull::new(ptr)
        .map(W::from)
        .ok_or_else(io::Error::last_os_error)
}

/// Explain [`ibv_post_recv`] errors.
fn recv_err_explanation(ret: i32) -> Option<&'static str> {
    match ret {
        libc::EINVAL => Some("invalid work request"),
        libc::ENOMEM => {
            Some("recv queue is full, or not enough resources to complete this operation")
        }
        libc::EFAULT => Some("invalid QP"),
        _ => None,
    }
}

/// Explain [`ibv_post_send`] errors.
fn send_err_explanation(ret: i32) -> Option<&'static str> {
    match ret {
        libc::EINVAL => Some("invalid work request"),
        libc::ENOMEM => {
            Some("send queue is full, or not enough resources to complete this operation")
        }
        libc::EFAULT => Some("invalid QP"),
        _ => None,
    }
}

fn ibv_sge_of(sge: &Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey,
    }
}

fn conn_param_of(param: &ConnParam) -> rdma_conn_param {
    rdma_conn_param {
        responder_resources: param.responder_resources,
        initiator_depth: param.initiator_depth,
        retry_count: param.retry_count,
        rnr_retry_count: param.rnr_retry_count,
        // SAFETY: all-zero is a valid `rdma_conn_param`.
        ..unsafe { mem::zeroed() }
    }
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

/// The rdma-core provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct VerbsProvider;

impl Verbs for VerbsProvider {
    type Device = IbvContext;
    type Pd = IbvPd;
    type CompChannel = IbvCompChannel;
    type Cq = IbvCq;
    type Qp = IbvQp;
    type Mr = IbvMr;

    fn device_name(&self, dev: &IbvContext) -> String {
        // SAFETY: the device outlives every context opened on it.
        unsafe {
            let name = ibv_get_device_name((*dev.as_ptr()).device);
            if name.is_null() {
                return String::from("<unknown>");
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }

    fn alloc_pd(&self, dev: &IbvContext) -> io::Result<IbvPd> {
        from_c_ptr(unsafe { ibv_alloc_pd(dev.as_ptr()) })
    }

    fn create_comp_channel(&self, dev: &IbvContext) -> io::Result<IbvCompChannel> {
        from_c_ptr(unsafe { ibv_create_comp_channel(dev.as_ptr()) })
    }

    fn create_cq(
        &self,
        dev: &IbvContext,
        depth: u32,
        channel: &IbvCompChannel,
    ) -> io::Result<IbvCq> {
        from_c_ptr(unsafe {
            ibv_create_cq(
                dev.as_ptr(),
                depth as i32,
                ptr::null_mut(),
                channel.as_ptr(),
                0,
            )
        })
    }

    fn req_notify_cq(&self, cq: &IbvCq) -> io::Result<()> {
        from_c_ret(unsafe { ibv_req_notify_cq(cq.as_ptr(), 0) })
    }

    fn get_cq_event(&self, channel: &IbvCompChannel) -> io::Result<()> {
        let mut cq = ptr::null_mut();
        let mut cq_context = ptr::null_mut();
        from_errno_ret(unsafe { ibv_get_cq_event(channel.as_ptr(), &mut cq, &mut cq_context) })
    }

    fn ack_cq_events(&self, cq: &IbvCq, n: u32) {
        unsafe { ibv_ack_cq_events(cq.as_ptr(), n) }
    }

    fn poll_cq(&self, cq: &IbvCq) -> io::Result<Option<Wc>> {
        // SAFETY: all-zero is a valid `ibv_wc`.
        let mut wc: ibv_wc = unsafe { mem::zeroed() };
        match unsafe { ibv_poll_cq(cq.as_ptr(), 1, &mut wc) } {
            0 => Ok(None),
            1 => Ok(Some(Wc::new(
                wc.wr_id,
                WcStatus::from(wc.status),
                WcOpcode::try_from(wc.opcode).ok(),
                wc.byte_len,
            ))),
            n => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ibv_poll_cq returned {}", n),
            )),
        }
    }

    unsafe fn reg_mr(
        &self,
        pd: &IbvPd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<IbvMr> {
        from_c_ptr(ibv_reg_mr(pd.as_ptr(), addr.cast(), len, i32::from(perm)))
    }

    fn dereg_mr(&self, mr: IbvMr) -> io::Result<()> {
        from_c_ret(unsafe { ibv_dereg_mr(mr.as_ptr()) })
    }

    fn post_send(&self, qp: &IbvQp, wr: &SendWr) -> io::Result<()> {
        let mut sge = ibv_sge_of(&wr.sge);
        let mut send_wr = ibv_send_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags: if wr.signaled {
                ibv_send_flags::IBV_SEND_SIGNALED.0
            } else {
                0
            },
            // SAFETY: POD type.
            ..unsafe { mem::zeroed() }
        };
        let mut bad_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_send(qp.as_ptr(), &mut send_wr, &mut bad_wr) };
        from_c_ret_explained(ret, send_err_explanation)
    }

    fn post_recv(&self, qp: &IbvQp, wr: &RecvWr) -> io::Result<()> {
        let mut sge = ibv_sge_of(&wr.sge);
        let mut recv_wr = ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let mut bad_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_recv(qp.as_ptr(), &mut recv_wr, &mut bad_wr) };
        from_c_ret_explained(ret, recv_err_explanation)
    }
}

impl Cm for VerbsProvider {
    type EventChannel = RdmaEventChannel;
    type Id = RdmaCmId;
    type EventRecord = RdmaCmEvent;

    fn create_event_channel(&self) -> io::Result<RdmaEventChannel> {
        from_c_ptr(unsafe { rdma_create_event_channel() })
    }

    fn destroy_event_channel(&self, channel: RdmaEventChannel) {
        unsafe { rdma_destroy_event_channel(channel.as_ptr()) }
    }

    fn create_id(&self, channel: &RdmaEventChannel) -> io::Result<RdmaCmId> {
        let mut id = ptr::null_mut();
        from_errno_ret(unsafe {
            rdma_create_id(
                channel.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_IB,
            )
        })?;
        from_c_ptr(id)
    }

    fn destroy_id(&self, id: &RdmaCmId) -> io::Result<()> {
        from_errno_ret(unsafe { rdma_destroy_id(id.as_ptr()) })
    }

    fn resolve_addr(&self, id: &RdmaCmId, dst: SocketAddr, timeout: Duration) -> io::Result<()> {
        let mut dst = addr::to_sockaddr(dst);
        from_errno_ret(unsafe {
            rdma_resolve_addr(
                id.as_ptr(),
                ptr::null_mut(),
                (&mut dst as *mut libc::sockaddr_storage).cast(),
                timeout_ms(timeout),
            )
        })
    }

    fn resolve_route(&self, id: &RdmaCmId, timeout: Duration) -> io::Result<()> {
        from_errno_ret(unsafe { rdma_resolve_route(id.as_ptr(), timeout_ms(timeout)) })
    }

    fn bind_addr(&self, id: &RdmaCmId, addr: SocketAddr) -> io::Result<()> {
        let mut addr = addr::to_sockaddr(addr);
        from_errno_ret(unsafe {
            rdma_bind_addr(
                id.as_ptr(),
                (&mut addr as *mut libc::sockaddr_storage).cast(),
            )
        })
    }

    fn listen(&self, id: &RdmaCmId, backlog: i32) -> io::Result<()> {
        from_errno_ret(unsafe { rdma_listen(id.as_ptr(), backlog) })
    }

    fn connect(&self, id: &RdmaCmId, param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param_of(param);
        from_errno_ret(unsafe { rdma_connect(id.as_ptr(), &mut param) })
    }

    fn accept(&self, id: &RdmaCmId, param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param_of(param);
        from_errno_ret(unsafe { rdma_accept(id.as_ptr(), &mut param) })
    }

    fn disconnect(&self, id: &RdmaCmId) -> io::Result<()> {
        from_errno_ret(unsafe { rdma_disconnect(id.as_ptr()) })
    }

    fn create_qp(
        &self,
        id: &RdmaCmId,
        pd: &IbvPd,
        cq: &IbvCq,
        caps: &QpCaps,
    ) -> io::Result<IbvQp> {
        let mut init_attr = ibv_qp_init_attr {
            send_cq: cq.as_ptr(),
            recv_cq: cq.as_ptr(),
            cap: ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: caps.max_inline_data,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            // SAFETY: POD type.
            ..unsafe { mem::zeroed() }
        };
        from_errno_ret(unsafe { rdma_create_qp(id.as_ptr(), pd.as_ptr(), &mut init_attr) })?;

        // SAFETY: `rdma_create_qp` stores the new QP in the endpoint.
        NonNull::new(unsafe { (*id.as_ptr()).qp })
            .map(IbvQp)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }

    fn destroy_qp(&self, id: &RdmaCmId, _qp: IbvQp) {
        unsafe { rdma_destroy_qp(id.as_ptr()) }
    }

    fn get_cm_event(&self, channel: &RdmaEventChannel) -> io::Result<RdmaCmEvent> {
        let mut event = ptr::null_mut();
        from_errno_ret(unsafe { rdma_get_cm_event(channel.as_ptr(), &mut event) })?;
        from_c_ptr(event)
    }

    fn event_payload(&self, record: &RdmaCmEvent) -> CmEvent<RdmaCmId> {
        // SAFETY: the record is valid until acknowledged, which consumes it.
        let event = unsafe { &*record.as_ptr() };
        let kind = CmEventKind::try_from(event.event).unwrap_or_else(|raw| {
            log::warn!("unknown CM event type {}", raw);
            CmEventKind::ConnectError
        });
        CmEvent {
            kind,
            // SAFETY: every CM event carries the endpoint it is about.
            id: RdmaCmId(unsafe { NonNull::new_unchecked(event.id) }),
            listen_id: NonNull::new(event.listen_id).map(RdmaCmId),
            status: event.status,
        }
    }

    fn ack_cm_event(&self, record: RdmaCmEvent) -> io::Result<()> {
        from_errno_ret(unsafe { rdma_ack_cm_event(record.as_ptr()) })
    }

    fn device(&self, id: &RdmaCmId) -> Option<IbvContext> {
        NonNull::new(unsafe { (*id.as_ptr()).verbs }).map(IbvContext)
    }

    fn local_addr(&self, id: &RdmaCmId) -> Option<SocketAddr> {
        unsafe { addr::from_sockaddr(rdma_get_local_addr(id.as_ptr())) }
    }

    fn peer_addr(&self, id: &RdmaCmId) -> Option<SocketAddr> {
        unsafe { addr::from_sockaddr(rdma_get_peer_addr(id.as_ptr())) }
    }
}

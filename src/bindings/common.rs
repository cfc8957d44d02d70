//! `static inline` functions of the C headers, which bindgen cannot see.

use super::private::*;
use libc::sockaddr;

/// Poll a CQ for work completions.
///
/// Poll a CQ for (possibly multiple) completions. If the return value
/// is < 0, an error occurred. If the return value is >= 0, it is the
/// number of completions returned. If the return value is
/// non-negative and strictly less than num_entries, then the CQ was
/// emptied.
#[inline]
pub unsafe fn ibv_poll_cq(
    cq: *mut ibv_cq,
    num_entries: ::std::os::raw::c_int,
    wc: *mut ibv_wc,
) -> ::std::os::raw::c_int {
    (*(*cq).context).ops.poll_cq.unwrap()(cq, num_entries, wc)
}

/// Request completion notification on a CQ.
///
/// An event will be added to the completion channel associated with the
/// CQ when an entry is added to the CQ. If `solicited_only` is non-zero,
/// only solicited or error completions trigger the event.
#[inline]
pub unsafe fn ibv_req_notify_cq(
    cq: *mut ibv_cq,
    solicited_only: ::std::os::raw::c_int,
) -> ::std::os::raw::c_int {
    (*(*cq).context).ops.req_notify_cq.unwrap()(cq, solicited_only)
}

/// Post a list of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> ::std::os::raw::c_int {
    (*(*qp).context).ops.post_send.unwrap()(qp, wr, bad_wr)
}

/// Post a list of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> ::std::os::raw::c_int {
    (*(*qp).context).ops.post_recv.unwrap()(qp, wr, bad_wr)
}

/// Get the local address bound to a connection manager identifier.
#[inline]
pub unsafe fn rdma_get_local_addr(id: *mut rdma_cm_id) -> *mut sockaddr {
    ::std::ptr::addr_of_mut!((*id).route.addr.__bindgen_anon_1).cast()
}

/// Get the remote address of a connection manager identifier.
#[inline]
pub unsafe fn rdma_get_peer_addr(id: *mut rdma_cm_id) -> *mut sockaddr {
    ::std::ptr::addr_of_mut!((*id).route.addr.__bindgen_anon_2).cast()
}

//! Bindings of libibverbs and librdmacm C interfaces.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod common;

mod private {
    use libc::*;
    include!(concat!(env!("OUT_DIR"), "/rdma_bindings.rs"));

    pub use super::common::*;
}

pub(crate) use self::private::*;

/// Open the device and create a context for further use.
pub use self::private::ibv_context;

/// Get the device name.
pub use self::private::ibv_get_device_name;

/// Allocate a protection domain.
pub use self::private::ibv_alloc_pd;

/// Protection domain.
pub use self::private::ibv_pd;

/// Create a completion event channel.
pub use self::private::ibv_create_comp_channel;

/// Completion event channel.
pub use self::private::ibv_comp_channel;

/// Create a completion queue.
pub use self::private::ibv_create_cq;

/// Completion queue.
pub use self::private::ibv_cq;

/// Wait for the next completion event on a completion event channel.
pub use self::private::ibv_get_cq_event;

/// Acknowledge completion events.
pub use self::private::ibv_ack_cq_events;

/// Work completion.
pub use self::private::ibv_wc;

/// Register a memory region.
pub use self::private::ibv_reg_mr;

/// Deregister a memory region.
pub use self::private::ibv_dereg_mr;

/// Memory region.
pub use self::private::ibv_mr;

/// Queue pair.
pub use self::private::ibv_qp;

/// Queue pair initialization attributes.
pub use self::private::ibv_qp_init_attr;

/// Send work request.
pub use self::private::ibv_send_wr;

/// Receive work request.
pub use self::private::ibv_recv_wr;

/// Scatter-gather entry.
pub use self::private::ibv_sge;

/// Create a connection manager event channel.
pub use self::private::rdma_create_event_channel;

/// Destroy a connection manager event channel.
pub use self::private::rdma_destroy_event_channel;

/// Connection manager event channel.
pub use self::private::rdma_event_channel;

/// Connection manager identifier.
pub use self::private::rdma_cm_id;

/// Connection manager event.
pub use self::private::rdma_cm_event;

/// Connection parameters for connect and accept.
pub use self::private::rdma_conn_param;

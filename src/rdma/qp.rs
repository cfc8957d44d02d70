use serde::{Deserialize, Serialize};

/// Queue pair capabilities.
///
/// Every queue pair created by this crate is a reliable-connected (RC) QP
/// whose send and receive queues share the transport context's single
/// completion queue; only the queue sizes are tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpCaps {
    /// The maximum number of outstanding work requests that can be posted
    /// to the send queue.
    pub max_send_wr: u32,

    /// The maximum number of outstanding work requests that can be posted
    /// to the receive queue.
    pub max_recv_wr: u32,

    /// The maximum number of scatter/gather elements in any work request
    /// that can be posted to the send queue.
    pub max_send_sge: u32,

    /// The maximum number of scatter/gather elements in any work request
    /// that can be posted to the receive queue.
    pub max_recv_sge: u32,

    /// The maximum message size (in bytes) that can be posted inline to the
    /// send queue. 0 if no inline message is requested.
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 10,
            max_recv_wr: 10,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

use crate::rdma::type_alias::{LKey, WrId};

/// Scatter/gather entry referencing a range of a registered buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

impl Sge {
    /// Cover the whole of `buf`, registered under `lkey`.
    #[inline]
    pub fn new(buf: &[u8], lkey: LKey) -> Self {
        Self {
            addr: buf.as_ptr() as u64,
            length: buf.len() as u32,
            lkey,
        }
    }
}

/// A single-SGE `IBV_WR_SEND` work request.
#[derive(Clone, Copy, Debug)]
pub struct SendWr {
    pub wr_id: WrId,
    pub sge: Sge,
    /// Whether a completion is generated for this request.
    pub signaled: bool,
}

/// A single-SGE receive work request.
#[derive(Clone, Copy, Debug)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Sge,
}

use std::{fmt, mem};

use thiserror::Error;

use crate::rdma::type_alias::WrId;

/// Opcode of a completion queue entry.
///
/// Discriminants follow `enum ibv_wc_opcode`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum WcOpcode {
    /// Send request.
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// RDMA compare-and-swap request.
    CompSwap = 3,
    /// RDMA fetch-and-add request.
    FetchAdd = 4,
    /// Memory window bind request.
    BindMw = 5,
    /// Receive request.
    Recv = 128,
    /// Receive request with immediate data.
    RecvRdmaImm = 129,
}

impl WcOpcode {
    /// Whether this opcode completes a receive work request.
    #[inline]
    pub fn is_recv(self) -> bool {
        (self as u32) & 128 != 0
    }
}

impl TryFrom<u32> for WcOpcode {
    type Error = u32;

    fn try_from(wc_opcode: u32) -> Result<Self, Self::Error> {
        Ok(match wc_opcode {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            x => return Err(x),
        })
    }
}

/// Status of a completion queue entry.
///
/// Discriminants follow `enum ibv_wc_status`. The descriptions are adapted
/// from [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// **Operation completed successfully:** the buffers this work request
    /// refers to are ready to be reused.
    #[error("success")]
    Success = 0,

    /// **Local Length Error:** an outgoing message exceeds the port's
    /// maximum message size, or an incoming message does not fit into the
    /// posted receive buffer.
    #[error("local length error")]
    LocLenErr = 1,

    /// **Local QP Operation Error:** an internal QP consistency error was
    /// detected while processing this work request.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// **Local EE Context Operation Error:** only relevant to RD QPs.
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// **Local Protection Error:** a scatter/gather entry does not reference
    /// a memory region valid for the requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// **Work Request Flushed Error:** the work request was outstanding when
    /// the QP transitioned into the error state, usually on disconnect.
    #[error("WR flush error")]
    WrFlushErr = 5,

    /// **Memory Window Binding Error.**
    #[error("memory window bind error")]
    MwBindErr = 6,

    /// **Bad Response Error:** the responder returned an unexpected transport
    /// layer opcode.
    #[error("bad response error")]
    BadRespErr = 7,

    /// **Local Access Error:** a protection error occurred on a local buffer
    /// while processing an incoming RDMA write with immediate.
    #[error("local access error")]
    LocAccessErr = 8,

    /// **Remote Invalid Request Error:** the responder detected an invalid
    /// message on the channel.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// **Remote Access Error:** a protection error occurred on a remote buffer.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// **Remote Operation Error:** the responder could not complete the
    /// operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// **Transport Retry Counter Exceeded:** the remote side sent neither
    /// ACK nor NAK. On the first message this usually means wrong connection
    /// attributes, afterwards it means the remote QP is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// **RNR Retry Counter Exceeded:** the remote side did not post a receive
    /// in time.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// **Local RDD Violation Error:** only relevant to RD QPs.
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// **Remote Invalid RD Request Error:** only relevant to RD QPs.
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// **Remote Aborted Error.**
    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// **Invalid EE Context Number:** only relevant to RD QPs.
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// **Invalid EE Context State Error:** only relevant to RD QPs.
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    /// **Fatal error.**
    #[error("fatal error")]
    FatalErr = 19,

    /// **Response Timeout Error.**
    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// **General Error:** any other error.
    #[error("general error")]
    GeneralErr = 21,
}

const WCSTATUS_UPPER_BOUND: u32 = WcStatus::GeneralErr as u32;

impl From<u32> for WcStatus {
    /// Statuses newer than this crate knows about are reported as
    /// [`WcStatus::GeneralErr`].
    fn from(wc_status: u32) -> Self {
        match wc_status {
            // SAFETY: valid status codes are contiguous and `repr(u32)`.
            x if x <= WCSTATUS_UPPER_BOUND => unsafe { mem::transmute::<u32, WcStatus>(x) },
            _ => WcStatus::GeneralErr,
        }
    }
}

/// Work completion entry.
///
/// A provider-neutral copy of the fields this crate reads from an `ibv_wc`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    pub(crate) wr_id: WrId,
    pub(crate) status: WcStatus,
    pub(crate) opcode: Option<WcOpcode>,
    pub(crate) byte_len: u32,
}

impl Wc {
    /// Assemble a work completion entry.
    ///
    /// `opcode` is only meaningful when `status` is success; providers are
    /// free to leave it unset otherwise.
    pub fn new(wr_id: WrId, status: WcStatus, opcode: Option<WcOpcode>, byte_len: u32) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
        }
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is success, return the number of bytes processed or transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.bytes()),
            err => Err(err),
        }
    }

    /// Get the opcode of the work request.
    #[inline]
    pub fn opcode(&self) -> Option<WcOpcode> {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("bytes", &self.byte_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_raw() {
        assert_eq!(WcStatus::from(0), WcStatus::Success);
        assert_eq!(WcStatus::from(5), WcStatus::WrFlushErr);
        assert_eq!(WcStatus::from(13), WcStatus::RnrRetryExcErr);
        assert_eq!(WcStatus::from(21), WcStatus::GeneralErr);
        assert_eq!(WcStatus::from(99), WcStatus::GeneralErr);
    }

    #[test]
    fn opcode_from_raw() {
        assert_eq!(WcOpcode::try_from(0), Ok(WcOpcode::Send));
        assert_eq!(WcOpcode::try_from(128), Ok(WcOpcode::Recv));
        assert_eq!(WcOpcode::try_from(7), Err(7));
        assert!(WcOpcode::RecvRdmaImm.is_recv());
        assert!(!WcOpcode::RdmaWrite.is_recv());
    }

    #[test]
    fn wc_ok() {
        let wc = Wc::new(3, WcStatus::Success, Some(WcOpcode::Recv), 1024);
        assert_eq!(wc.ok(), Ok(1024));
        assert_eq!(wc.wr_id(), 3);

        let wc = Wc::new(3, WcStatus::WrFlushErr, None, 0);
        assert_eq!(wc.ok(), Err(WcStatus::WrFlushErr));
        assert_eq!(wc.opcode(), None);
    }
}

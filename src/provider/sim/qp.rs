use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::cq::SimCq;
use super::Fabric;
use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
use crate::rdma::qp::QpCaps;
use crate::rdma::wr::{RecvWr, SendWr};
use crate::rdma::type_alias::WrId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QpStatus {
    Init,
    Rts,
    Error,
    Destroyed,
}

struct QpState {
    status: QpStatus,
    recvs: VecDeque<RecvWr>,
    /// Messages that arrived before a receive was posted.
    inbound: VecDeque<Vec<u8>>,
    peer: Weak<QpInner>,
}

struct QpInner {
    handle: u64,
    cq: SimCq,
    caps: QpCaps,
    fabric: Arc<Fabric>,
    state: Mutex<QpState>,
}

/// Simulated RC queue pair.
///
/// Both sub-queues report to the same CQ. Sends are delivered to the peer
/// synchronously; a send that finds no posted receive waits in the peer's
/// inbound queue instead of failing, as an RNR retry would.
#[derive(Clone)]
pub struct SimQp(Arc<QpInner>);

impl SimQp {
    pub(super) fn new(handle: u64, cq: SimCq, caps: QpCaps, fabric: Arc<Fabric>) -> Self {
        Self(Arc::new(QpInner {
            handle,
            cq,
            caps,
            fabric,
            state: Mutex::new(QpState {
                status: QpStatus::Init,
                recvs: VecDeque::new(),
                inbound: VecDeque::new(),
                peer: Weak::new(),
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, QpState> {
        self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, wr_id: WrId, status: WcStatus, opcode: Option<WcOpcode>, len: usize) {
        self.0.cq.push(Wc::new(wr_id, status, opcode, len as u32));
    }

    /// Move to RTS, sending to `peer`.
    pub(super) fn connect(&self, peer: &SimQp) {
        let mut state = self.state();
        if state.status == QpStatus::Init {
            state.status = QpStatus::Rts;
            state.peer = Arc::downgrade(&peer.0);
        }
    }

    /// Move to the error state, flushing outstanding receives.
    pub(super) fn set_error(&self) {
        let mut state = self.state();
        if matches!(state.status, QpStatus::Error | QpStatus::Destroyed) {
            return;
        }
        state.status = QpStatus::Error;
        state.inbound.clear();
        state.peer = Weak::new();
        for wr in state.recvs.drain(..) {
            self.complete(wr.wr_id, WcStatus::WrFlushErr, None, 0);
        }
    }

    pub(super) fn destroy(&self) {
        let mut state = self.state();
        state.status = QpStatus::Destroyed;
        state.recvs.clear();
        state.inbound.clear();
        state.peer = Weak::new();
    }

    /// Consume `wr` with an arrived message. Called with the state locked.
    fn complete_recv(&self, wr: &RecvWr, data: &[u8]) {
        if data.len() > wr.sge.length as usize {
            self.complete(wr.wr_id, WcStatus::LocLenErr, None, 0);
        } else if self.0.fabric.write(&wr.sge, data) {
            self.complete(wr.wr_id, WcStatus::Success, Some(WcOpcode::Recv), data.len());
        } else {
            self.complete(wr.wr_id, WcStatus::LocProtErr, None, 0);
        }
    }

    fn deliver(&self, data: Vec<u8>) {
        let mut state = self.state();
        if state.status != QpStatus::Rts {
            return;
        }
        match state.recvs.pop_front() {
            Some(wr) => self.complete_recv(&wr, &data),
            None => state.inbound.push_back(data),
        }
    }

    pub(super) fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let peer = {
            let state = self.state();
            match state.status {
                QpStatus::Init | QpStatus::Destroyed => {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL))
                }
                QpStatus::Error => {
                    self.complete(wr.wr_id, WcStatus::WrFlushErr, None, 0);
                    return Ok(());
                }
                QpStatus::Rts => state.peer.upgrade(),
            }
        };

        let Some(data) = self.0.fabric.read(&wr.sge) else {
            self.complete(wr.wr_id, WcStatus::LocProtErr, None, 0);
            return Ok(());
        };
        let Some(peer) = peer else {
            self.complete(wr.wr_id, WcStatus::RetryExcErr, None, 0);
            return Ok(());
        };

        if wr.signaled {
            self.complete(wr.wr_id, WcStatus::Success, Some(WcOpcode::Send), data.len());
        }
        SimQp(peer).deliver(data);
        Ok(())
    }

    pub(super) fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut state = self.state();
        match state.status {
            QpStatus::Init | QpStatus::Rts => {}
            QpStatus::Error => {
                self.complete(wr.wr_id, WcStatus::WrFlushErr, None, 0);
                return Ok(());
            }
            QpStatus::Destroyed => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }

        if let Some(data) = state.inbound.pop_front() {
            self.complete_recv(wr, &data);
            return Ok(());
        }
        if state.recvs.len() >= self.0.caps.max_recv_wr as usize {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        state.recvs.push_back(*wr);
        Ok(())
    }
}

impl std::fmt::Debug for SimQp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimQp(#{})", self.0.handle)
    }
}

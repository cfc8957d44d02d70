use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::rdma::cq::Wc;

/// Wakes the thread blocked on a completion channel.
#[derive(Default)]
pub(super) struct Notifier {
    pending: Mutex<usize>,
    cond: Condvar,
}

impl Notifier {
    fn notify(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending += 1;
        self.cond.notify_one();
    }

    pub(super) fn wait(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending == 0 {
            pending = self.cond.wait(pending).unwrap_or_else(|e| e.into_inner());
        }
        *pending -= 1;
    }
}

/// Simulated completion event channel.
#[derive(Clone, Default)]
pub struct SimCompChannel(pub(super) Arc<Notifier>);

struct CqInner {
    entries: Mutex<VecDeque<Wc>>,
    armed: AtomicBool,
    depth: usize,
    channel: Arc<Notifier>,
}

/// Simulated completion queue.
///
/// Completions are reported in the order they are pushed. An armed CQ wakes
/// its channel once, on the next push, and must be re-armed afterwards.
#[derive(Clone)]
pub struct SimCq(Arc<CqInner>);

impl SimCq {
    pub(super) fn new(depth: u32, channel: &SimCompChannel) -> Self {
        Self(Arc::new(CqInner {
            entries: Mutex::new(VecDeque::with_capacity(depth as usize)),
            armed: AtomicBool::new(false),
            depth: depth as usize,
            channel: channel.0.clone(),
        }))
    }

    pub(super) fn push(&self, wc: Wc) {
        {
            let mut entries = self.0.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.len() >= self.0.depth {
                log::warn!("simulated CQ overrun: {} entries outstanding", entries.len());
            }
            entries.push_back(wc);
        }
        if self.0.armed.swap(false, Ordering::AcqRel) {
            self.0.channel.notify();
        }
    }

    pub(super) fn arm(&self) {
        self.0.armed.store(true, Ordering::Release);
    }

    pub(super) fn pop(&self) -> Option<Wc> {
        self.0
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Number of completions not yet polled.
    pub fn len(&self) -> usize {
        self.0.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::cq::{WcOpcode, WcStatus};

    fn wc(wr_id: u64) -> Wc {
        Wc::new(wr_id, WcStatus::Success, Some(WcOpcode::Send), 0)
    }

    #[test]
    fn one_wakeup_per_arm() {
        let channel = SimCompChannel::default();
        let cq = SimCq::new(4, &channel);

        cq.push(wc(0));
        assert_eq!(*channel.0.pending.lock().unwrap(), 0);

        cq.arm();
        cq.push(wc(1));
        cq.push(wc(2));
        assert_eq!(*channel.0.pending.lock().unwrap(), 1);
        channel.0.wait();

        assert_eq!(cq.len(), 3);
        assert_eq!(cq.pop().map(|wc| wc.wr_id()), Some(0));
        assert_eq!(cq.pop().map(|wc| wc.wr_id()), Some(1));
        assert_eq!(cq.pop().map(|wc| wc.wr_id()), Some(2));
        assert!(cq.pop().is_none());
    }
}

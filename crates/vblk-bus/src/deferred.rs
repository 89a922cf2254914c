//! FIFO of requests that arrived while the bus was holding non-lifecycle requests.
//!
//! Queued requests stay cancelable: each carries a cancel routine that pulls it back out of the
//! queue and completes it with `Cancelled`. The routine is deregistered when the request is
//! popped for replay.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::error::Status;
use crate::irp::Irp;

#[derive(Debug, Default)]
pub struct DeferredQueue {
    inner: Arc<Mutex<VecDeque<Irp>>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `irp` at the back of the queue.
    ///
    /// Returns `Pending`, or `Cancelled` if the request had already been cancelled (it is then
    /// completed right away).
    pub fn push(&self, irp: Irp) -> Status {
        let id = irp.id();
        let weak: Weak<Mutex<VecDeque<Irp>>> = Arc::downgrade(&self.inner);
        let routine = Box::new(move || {
            let Some(queue) = weak.upgrade() else {
                return;
            };
            let cancelled = {
                let mut queue = queue.lock().expect("deferred queue lock poisoned");
                let index = queue.iter().position(|irp| irp.id() == id);
                index.and_then(|index| queue.remove(index))
            };
            if let Some(irp) = cancelled {
                tracing::debug!(irp = id, "cancelled while deferred");
                irp.complete_with(Status::Cancelled);
            }
        });

        let mut queue = self.inner.lock().expect("deferred queue lock poisoned");
        if !irp.set_cancel_routine(routine) {
            drop(queue);
            irp.complete_with(Status::Cancelled);
            return Status::Cancelled;
        }
        tracing::debug!(irp = id, depth = queue.len() + 1, "deferring request");
        queue.push_back(irp);
        Status::Pending
    }

    /// Takes the oldest request that has not been cancelled.
    pub fn pop(&self) -> Option<Irp> {
        let mut cancelled = Vec::new();
        let next = {
            let mut queue = self.inner.lock().expect("deferred queue lock poisoned");
            loop {
                let Some(irp) = queue.pop_front() else {
                    break None;
                };
                // A concurrent cancel that already claimed the routine will find nothing to
                // remove, so it is completed here instead.
                if irp.clear_cancel_routine() && !irp.is_cancelled() {
                    break Some(irp);
                }
                cancelled.push(irp);
            }
        };
        for irp in cancelled {
            irp.complete_with(Status::Cancelled);
        }
        next
    }

    /// Removes every queued request, deregistering their cancel routines.
    pub fn drain(&self) -> Vec<Irp> {
        let drained: Vec<Irp> = self
            .inner
            .lock()
            .expect("deferred queue lock poisoned")
            .drain(..)
            .collect();
        for irp in &drained {
            irp.clear_cancel_routine();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("deferred queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irp::{IrpHandle, Request};
    use pretty_assertions::assert_eq;

    fn request() -> (Irp, IrpHandle) {
        Irp::new(Request::Create)
    }

    #[test]
    fn pop_is_fifo() {
        let queue = DeferredQueue::new();
        let mut ids = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let (irp, handle) = request();
            ids.push(irp.id());
            assert_eq!(queue.push(irp), Status::Pending);
            handles.push(handle);
        }

        let mut popped = Vec::new();
        while let Some(irp) = queue.pop() {
            popped.push(irp.id());
            irp.complete_with(Status::Success);
        }
        assert_eq!(popped, ids);
    }

    #[test]
    fn cancelled_request_is_removed_and_not_replayed() {
        let queue = DeferredQueue::new();
        let (a, ha) = request();
        let (b, hb) = request();
        let b_id = b.id();
        queue.push(a);
        queue.push(b);

        ha.cancel();
        assert_eq!(ha.wait().status, Status::Cancelled);
        assert_eq!(queue.len(), 1);

        let next = queue.pop().expect("b is still queued");
        assert_eq!(next.id(), b_id);
        next.complete_with(Status::Success);
        assert_eq!(hb.wait().status, Status::Success);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn push_of_cancelled_request_completes_it() {
        let queue = DeferredQueue::new();
        let (irp, handle) = request();
        handle.cancel();
        assert_eq!(queue.push(irp), Status::Cancelled);
        assert!(queue.is_empty());
        assert_eq!(handle.wait().status, Status::Cancelled);
    }

    #[test]
    fn cancel_after_replay_is_a_no_op() {
        let queue = DeferredQueue::new();
        let (irp, handle) = request();
        queue.push(irp);

        let irp = queue.pop().unwrap();
        handle.cancel();
        assert!(handle.try_result().is_none());
        irp.complete_with(Status::Success);
        assert_eq!(handle.wait().status, Status::Success);
    }

    #[test]
    fn drain_returns_everything_in_order() {
        let queue = DeferredQueue::new();
        let (a, _ha) = request();
        let (b, _hb) = request();
        let ids = [a.id(), b.id()];
        queue.push(a);
        queue.push(b);

        let drained = queue.drain();
        assert_eq!(drained.iter().map(Irp::id).collect::<Vec<_>>(), ids);
        for irp in drained {
            irp.complete_with(Status::NoSuchDevice);
        }
    }
}

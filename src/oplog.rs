//! FIFO log of mutations that reach a subtree while it is being rebuilt.
//!
//! Every mutation applied to a detached subtree is also appended here. The
//! worker replays the log, in arrival order, into the freshly built copy
//! before splicing it back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::node::Inherited;
use crate::types::BoundingBox3D;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Operation<P> {
    AddPoint(P),
    AddBox(BoundingBox3D),
    /// Replayed with an exhaustive search, since the rebuilt subtree splits
    /// its points differently from the one the delete originally ran on.
    DeletePoint(P),
    DeleteBox(BoundingBox3D),
    DownsampleDelete(BoundingBox3D),
    SetCovered(P),
    PushDown(Inherited),
}

pub(crate) struct OperationLog<P> {
    queue: Mutex<VecDeque<Operation<P>>>,
    peak: AtomicUsize,
}

impl<P> OperationLog<P> {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            peak: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, op: Operation<P>) {
        let mut queue = self.queue.lock();
        queue.push_back(op);
        self.peak.fetch_max(queue.len(), Ordering::Relaxed);
    }

    pub(crate) fn pop(&self) -> Option<Operation<P>> {
        self.queue.lock().pop_front()
    }

    /// Drop every pending entry, returning how many there were.
    pub(crate) fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let len = queue.len();
        queue.clear();
        len
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Longest the queue has been since the last call.
    pub(crate) fn take_peak(&self) -> usize {
        self.peak.swap(0, Ordering::Relaxed)
    }
}

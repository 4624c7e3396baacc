//! Deferred self-dispatch with internal authority.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::envelope::Kwargs;

/// A queue of deferred dispatches owned by a root node.
///
/// A handler that wants to re-enter the dispatcher with internal authority
/// (e.g. finishing a sign-in by posting `location.enter`) enqueues here
/// instead of dispatching inline. The engine drains the queue only after
/// the current dispatch frame fully unwinds, which breaks reentrancy; if
/// the triggering dispatch failed, queued entries are discarded.
#[derive(Debug, Default)]
pub struct Loopback {
    queue: Mutex<VecDeque<(String, Kwargs)>>,
}

impl Loopback {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a deferred dispatch of `path` with internal authority.
    pub fn send(&self, path: impl Into<String>, kwargs: Kwargs) {
        self.queue
            .lock()
            .expect("loopback queue poisoned")
            .push_back((path.into(), kwargs));
    }

    /// Takes everything queued so far, in enqueue order.
    pub(crate) fn drain(&self) -> Vec<(String, Kwargs)> {
        self.queue
            .lock()
            .expect("loopback queue poisoned")
            .drain(..)
            .collect()
    }

    /// Discards everything queued so far.
    pub(crate) fn clear(&self) {
        self.queue.lock().expect("loopback queue poisoned").clear();
    }
}

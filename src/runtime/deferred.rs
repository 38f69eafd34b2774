//! Deferred main-context initialization queue
//!
//! Any thread may enqueue; only the main pump drains. The `has_work` flag is
//! a hint read without locking: a producer sends first and raises the flag
//! second, the pump clears the flag first and drains second, so a request is
//! never left behind with the flag down.

use crate::library::NativeLibrary;
use crate::script::Script;
use flume::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// One request to initialize `library` on the main context
pub(crate) struct DeferredInit {
    pub library: Arc<NativeLibrary>,
    /// Script waiting for the library, notified once it is ready
    pub script: Option<Weak<Script>>,
}

pub(crate) struct DeferredQueue {
    sender: Sender<DeferredInit>,
    receiver: Receiver<DeferredInit>,
    has_work: AtomicBool,
}

impl DeferredQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            has_work: AtomicBool::new(false),
        }
    }

    pub fn push(&self, request: DeferredInit) {
        // The queue owns its receiver, so the channel cannot be disconnected.
        let _ = self.sender.send(request);
        self.has_work.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn has_work(&self) -> bool {
        self.has_work.load(Ordering::Relaxed)
    }

    /// Take every queued request in enqueue order
    pub fn drain(&self) -> Vec<DeferredInit> {
        if !self.has_work.swap(false, Ordering::Relaxed) {
            return Vec::new();
        }
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

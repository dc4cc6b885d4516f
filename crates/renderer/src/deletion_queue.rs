//! Deferred teardown.
//!
//! A [`DeletionQueue`] records teardown actions for one lifetime scope and
//! runs them most-recent-first when the scope ends. Later registrations
//! usually depend on earlier ones (a view on its image, a table on its
//! pool), so reverse order tears dependents down before what they depend on.
//!
//! Two scopes exist in the pipeline: the process-wide queue owned by
//! [`crate::GpuContext`], flushed once at shutdown, and one queue per frame
//! slot, flushed each time the slot is reused.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use vkpipe_renderer::DeletionQueue;
//!
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let mut queue = DeletionQueue::new();
//! for name in ["image", "view"] {
//!     let log = Arc::clone(&log);
//!     queue.push(move || log.lock().unwrap().push(name));
//! }
//! queue.flush();
//! assert_eq!(*log.lock().unwrap(), ["view", "image"]);
//! ```

use tracing::trace;

type Action = Box<dyn FnOnce() + Send>;

/// LIFO list of pending teardown actions.
#[derive(Default)]
pub struct DeletionQueue {
    actions: Vec<Action>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown action.
    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Defer dropping `value` until the queue is flushed.
    ///
    /// RAII wrappers release their device object on drop, so this is how
    /// they are handed to a scope.
    pub fn push_drop<T: Send + 'static>(&mut self, value: T) {
        self.push(move || drop(value));
    }

    /// Run every action, most recently pushed first, leaving the queue empty.
    pub fn flush(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        trace!("Flushing {} deferred deletions", self.actions.len());
        while let Some(action) = self.actions.pop() {
            action();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for DeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("pending", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<usize>>>, impl Fn(usize) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |i: usize| {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(i)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn test_flush_runs_in_reverse_order() {
        for k in 0..8 {
            let (log, make) = recorder();
            let mut queue = DeletionQueue::new();
            for i in 0..k {
                queue.push(make(i));
            }
            assert_eq!(queue.len(), k);

            queue.flush();

            let expected: Vec<usize> = (0..k).rev().collect();
            assert_eq!(*log.lock().unwrap(), expected);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_flush_on_empty_queue_is_noop() {
        let mut queue = DeletionQueue::new();
        queue.flush();
        queue.flush();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_actions_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut queue = DeletionQueue::new();
        let counter = Arc::clone(&count);
        queue.push(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue.flush();
        queue.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_drop_defers_drop() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = DeletionQueue::new();
        queue.push_drop(Tracked(Arc::clone(&drops)));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        queue.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_flushes_pending_actions() {
        let (log, make) = recorder();
        {
            let mut queue = DeletionQueue::new();
            queue.push(make(1));
            queue.push(make(2));
        }
        assert_eq!(*log.lock().unwrap(), [2, 1]);
    }

    #[test]
    fn test_deletion_queue_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<DeletionQueue>();
    }
}

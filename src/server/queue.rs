//! FIFO of accepted-but-unclaimed connections.
//!
//! The acceptor thread is the only producer. Consumers either poll
//! ([`PendingQueue::try_pop`]) or block on the condition variable
//! ([`PendingQueue::pop_wait`]) until an item arrives or the queue is closed.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closing: bool,
}

/// Why [`PendingQueue::push`] handed an item back.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Refused<T> {
    /// The queue was closed.
    Closing(T),
    /// The capacity bound was reached.
    Full(T),
}

/// Thread-safe pending-connection queue.
#[derive(Debug)]
pub(crate) struct PendingQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: Option<NonZeroUsize>,
}

impl<T> PendingQueue<T> {
    /// Create an open queue. `capacity` of `None` means unbounded.
    pub(crate) fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closing: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` and wake one waiter.
    ///
    /// Hands the item back, tagged with the cause, if the queue is closing
    /// or full.
    pub(crate) fn push(&self, item: T) -> Result<(), Refused<T>> {
        let mut inner = self.lock();
        if inner.closing {
            return Err(Refused::Closing(item));
        }
        if let Some(capacity) = self.capacity {
            if inner.items.len() >= capacity.get() {
                return Err(Refused::Full(item));
            }
        }
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Non-blocking pop.
    pub(crate) fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Blocking pop. Returns `None` only once the queue is closing and empty.
    pub(crate) fn pop_wait(&self) -> Option<T> {
        let inner = self.lock();
        let mut inner = self
            .available
            .wait_while(inner, |inner| inner.items.is_empty() && !inner.closing)
            .unwrap_or_else(PoisonError::into_inner);
        inner.items.pop_front()
    }

    /// Whether an item is queued right now.
    pub(crate) fn has_items(&self) -> bool {
        !self.lock().items.is_empty()
    }

    /// Number of queued items.
    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Refuse further pushes, wake every waiter, and return what was queued.
    pub(crate) fn close(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.closing = true;
        let drained = inner.items.drain(..).collect();
        drop(inner);
        self.available.notify_all();
        drained
    }

    /// Accept pushes again after a [`PendingQueue::close`].
    pub(crate) fn reopen(&self) {
        self.lock().closing = false;
    }
}

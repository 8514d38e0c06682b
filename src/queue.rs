// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The bounded blocking queue connecting pipeline stages.
//!
//! Ownership of each item moves through the queue: the producer gives it up
//! on a successful `push`, the consumer takes it on `pop`. A failed push
//! hands the item straight back, and dropping the queue drops whatever is
//! still enqueued, so no item is ever observed twice or leaked.

use std::collections::VecDeque;
use std::fmt;

use base::{Condvar, Mutex};

/// A push that didn't take ownership; the item comes back to the caller.
pub enum PushError<T> {
    /// The queue is at capacity. Pushes never block on a full queue; the
    /// producer decides whether to drop or retry.
    Full(T),
    /// The queue has been closed; no further items will be accepted.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(t) | PushError::Closed(t) => t,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PushError::Full(_) => "PushError::Full",
            PushError::Closed(_) => "PushError::Closed",
        })
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer FIFO of owned items, closable.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    /// Signalled whenever an item is taken and broadcast on close. Pushes
    /// are fail-fast and never wait on it; it exists for the contract's
    /// symmetry and for any future blocking-push variant.
    not_full: Condvar,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends `item`, failing fast when the queue is full or closed.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut l = self.inner.lock();
        if l.closed {
            return Err(PushError::Closed(item));
        }
        if l.items.len() == self.capacity {
            return Err(PushError::Full(item));
        }
        l.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Takes the oldest item, blocking while the queue is empty and open.
    ///
    /// Returns `None` only once the queue is closed *and* drained; items
    /// enqueued before `close` are always delivered first.
    pub fn pop(&self) -> Option<T> {
        let mut l = self.inner.lock();
        loop {
            if let Some(item) = l.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if l.closed {
                return None;
            }
            l = self.not_empty.wait(l);
        }
    }

    /// Closes the queue, waking all blocked consumers. Idempotent.
    pub fn close(&self) {
        let mut l = self.inner.lock();
        l.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
